//! Bounded-retry asset loading for trials that need an external media file.
//!
//! The loader never blocks. A failed attempt schedules the next one
//! `retry_delay_ms` later; the engine calls [`AssetLoader::poll`] each frame
//! and the retry is issued once that instant has passed.

use crate::error::EngineError;
use cogex_core::{RendererSignal, SignalKind, Stage, StimulusDescriptor, StimulusRenderer, Ticket};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 500,
        }
    }
}

/// Base directory relative asset locators are resolved against.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetRoot {
    base: Option<PathBuf>,
}

impl AssetRoot {
    pub fn new(base: Option<PathBuf>) -> Result<Self, EngineError> {
        if let Some(dir) = &base {
            if !dir.exists() {
                return Err(EngineError::MissingAssetRoot(dir.clone()));
            }
        }
        Ok(Self { base })
    }

    pub fn base(&self) -> Option<&Path> {
        self.base.as_deref()
    }

    /// URLs and absolute paths pass through; everything else is joined onto
    /// the base directory, or onto the working directory when there is none.
    pub fn resolve(&self, locator: &str) -> Result<String, String> {
        let locator = locator.trim();
        if locator.is_empty() {
            return Err("empty asset locator".to_string());
        }
        if locator.contains("://") || Path::new(locator).is_absolute() {
            return Ok(locator.to_string());
        }
        let relative = locator.strip_prefix("./").unwrap_or(locator);
        let joined = match &self.base {
            Some(base) => base.join(relative),
            None => std::path::absolute(relative)
                .map_err(|e| format!("cannot resolve '{locator}': {e}"))?,
        };
        Ok(joined.to_string_lossy().into_owned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadProgress {
    Pending,
    Ready { attempts: u32, resolved: String },
    Failed { attempts: u32, reason: String },
    /// The signal or load belongs to a trial that is no longer live.
    Stale,
}

#[derive(Debug)]
struct ActiveLoad {
    generation: u64,
    descriptor: StimulusDescriptor,
    attempts: u32,
    retry_at: Option<u64>,
}

#[derive(Debug)]
pub struct AssetLoader {
    policy: RetryPolicy,
    root: AssetRoot,
    active: Option<ActiveLoad>,
}

impl AssetLoader {
    pub fn new(policy: RetryPolicy, root: AssetRoot) -> Self {
        Self {
            policy,
            root,
            active: None,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Issues the first load attempt for `descriptor` under `generation`.
    ///
    /// A locator that cannot be resolved fails immediately; retrying would
    /// only resolve it the same way again.
    pub fn begin<Rd: StimulusRenderer + ?Sized>(
        &mut self,
        renderer: &mut Rd,
        descriptor: &StimulusDescriptor,
        generation: u64,
    ) -> LoadProgress {
        self.active = None;
        let Some(locator) = descriptor.asset.as_deref() else {
            return LoadProgress::Failed {
                attempts: 0,
                reason: "trial has no asset to load".to_string(),
            };
        };
        let resolved = match self.root.resolve(locator) {
            Ok(resolved) => resolved,
            Err(reason) => {
                warn!(generation, locator, %reason, "asset locator rejected");
                return LoadProgress::Failed {
                    attempts: 1,
                    reason,
                };
            }
        };

        let mut descriptor = descriptor.clone();
        descriptor.asset = Some(resolved.clone());
        renderer.present(
            &descriptor,
            Ticket {
                generation,
                stage: Stage::Load,
            },
        );
        debug!(generation, asset = %resolved, "asset load started");
        self.active = Some(ActiveLoad {
            generation,
            descriptor,
            attempts: 1,
            retry_at: None,
        });
        LoadProgress::Pending
    }

    pub fn on_signal(
        &mut self,
        signal: &RendererSignal,
        now_ns: u64,
        live_generation: u64,
    ) -> LoadProgress {
        let Some(active) = self.active.as_ref() else {
            return LoadProgress::Stale;
        };
        if signal.ticket.stage != Stage::Load
            || signal.ticket.generation != active.generation
            || active.generation != live_generation
        {
            return LoadProgress::Stale;
        }
        if active.retry_at.is_some() {
            return LoadProgress::Pending;
        }

        match &signal.kind {
            SignalKind::Ready => {
                let attempts = active.attempts;
                let resolved = active.descriptor.asset.clone().unwrap_or_default();
                self.active = None;
                info!(generation = live_generation, attempts, asset = %resolved, "asset ready");
                LoadProgress::Ready { attempts, resolved }
            }
            SignalKind::Error(reason) => self.fail_attempt(now_ns, reason.clone()),
            SignalKind::Ended => LoadProgress::Pending,
        }
    }

    /// Issues a scheduled retry once its time has come.
    pub fn poll<Rd: StimulusRenderer + ?Sized>(
        &mut self,
        renderer: &mut Rd,
        now_ns: u64,
        live_generation: u64,
    ) -> LoadProgress {
        let Some(active) = self.active.as_mut() else {
            return LoadProgress::Stale;
        };
        if active.generation != live_generation {
            self.active = None;
            return LoadProgress::Stale;
        }
        match active.retry_at {
            Some(at) if now_ns >= at => {
                active.retry_at = None;
                active.attempts += 1;
                info!(
                    generation = active.generation,
                    attempt = active.attempts,
                    max_attempts = self.policy.max_attempts,
                    "retrying asset load"
                );
                renderer.present(
                    &active.descriptor,
                    Ticket {
                        generation: active.generation,
                        stage: Stage::Load,
                    },
                );
                LoadProgress::Pending
            }
            _ => LoadProgress::Pending,
        }
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.active.as_ref().and_then(|a| a.retry_at)
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn cancel(&mut self) {
        self.active = None;
    }

    fn fail_attempt(&mut self, now_ns: u64, reason: String) -> LoadProgress {
        let Some(active) = self.active.as_mut() else {
            return LoadProgress::Stale;
        };
        if active.attempts < self.policy.max_attempts {
            let retry_at = now_ns + self.policy.retry_delay_ms * 1_000_000;
            warn!(
                generation = active.generation,
                attempt = active.attempts,
                max_attempts = self.policy.max_attempts,
                %reason,
                "asset load failed, retry scheduled"
            );
            active.retry_at = Some(retry_at);
            LoadProgress::Pending
        } else {
            let attempts = active.attempts;
            warn!(
                generation = active.generation,
                attempts,
                %reason,
                "asset load failed, giving up"
            );
            self.active = None;
            LoadProgress::Failed { attempts, reason }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cogex_core::StimulusKind;

    #[derive(Default)]
    struct Recorder {
        presented: Vec<(Option<String>, Ticket)>,
    }

    impl StimulusRenderer for Recorder {
        fn present(&mut self, descriptor: &StimulusDescriptor, ticket: Ticket) {
            self.presented.push((descriptor.asset.clone(), ticket));
        }
        fn stop(&mut self) {}
        fn poll_signal(&mut self) -> Option<RendererSignal> {
            None
        }
    }

    fn signal(generation: u64, kind: SignalKind) -> RendererSignal {
        RendererSignal {
            ticket: Ticket {
                generation,
                stage: Stage::Load,
            },
            kind,
        }
    }

    fn video(locator: &str) -> StimulusDescriptor {
        StimulusDescriptor::new(StimulusKind::Blank).with_asset(locator)
    }

    const MS: u64 = 1_000_000;

    #[test]
    fn resolves_relative_locators_against_the_root() {
        let root = AssetRoot::new(Some(std::env::temp_dir())).unwrap();
        let resolved = root.resolve("./img/hard1.mp4").unwrap();
        assert!(resolved.ends_with("hard1.mp4"));
        assert!(resolved.starts_with(&*std::env::temp_dir().to_string_lossy()));

        assert_eq!(
            root.resolve("https://cdn.example.org/a.mp4").unwrap(),
            "https://cdn.example.org/a.mp4"
        );
        assert!(root.resolve("   ").is_err());
    }

    #[test]
    fn without_a_root_locators_become_absolute() {
        let cwd = std::env::current_dir().unwrap();
        let resolved = AssetRoot::default().resolve("./img/a.png").unwrap();
        assert!(Path::new(&resolved).is_absolute());
        assert_eq!(PathBuf::from(&resolved), cwd.join("img/a.png"));
        assert_eq!(
            AssetRoot::default().resolve("/srv/media/b.mp4").unwrap(),
            "/srv/media/b.mp4"
        );
    }

    #[test]
    fn missing_root_is_an_init_error() {
        let err = AssetRoot::new(Some(PathBuf::from("/definitely/not/here/cogex"))).unwrap_err();
        assert!(matches!(err, EngineError::MissingAssetRoot(_)));
    }

    #[test]
    fn retries_are_bounded_and_spaced() {
        let mut renderer = Recorder::default();
        let mut loader = AssetLoader::new(RetryPolicy::default(), AssetRoot::default());

        assert_eq!(loader.begin(&mut renderer, &video("a.mp4"), 4), LoadProgress::Pending);
        assert_eq!(
            loader.on_signal(&signal(4, SignalKind::Error("404".into())), 0, 4),
            LoadProgress::Pending
        );
        assert_eq!(loader.next_deadline(), Some(500 * MS));

        // Nothing happens before the delay has elapsed.
        loader.poll(&mut renderer, 499 * MS, 4);
        assert_eq!(renderer.presented.len(), 1);
        loader.poll(&mut renderer, 500 * MS, 4);
        assert_eq!(renderer.presented.len(), 2);

        loader.on_signal(&signal(4, SignalKind::Error("404".into())), 600 * MS, 4);
        loader.poll(&mut renderer, 1100 * MS, 4);
        assert_eq!(renderer.presented.len(), 3);

        let outcome = loader.on_signal(&signal(4, SignalKind::Error("404".into())), 1200 * MS, 4);
        assert_eq!(
            outcome,
            LoadProgress::Failed {
                attempts: 3,
                reason: "404".into()
            }
        );
        assert!(!loader.is_active());
        assert!(renderer.presented.iter().all(|(_, t)| t.stage == Stage::Load));
    }

    #[test]
    fn ready_reports_attempts_used() {
        let mut renderer = Recorder::default();
        let mut loader = AssetLoader::new(RetryPolicy::default(), AssetRoot::default());
        loader.begin(&mut renderer, &video("a.mp4"), 1);
        loader.on_signal(&signal(1, SignalKind::Error("decode".into())), 0, 1);
        loader.poll(&mut renderer, 500 * MS, 1);
        let outcome = loader.on_signal(&signal(1, SignalKind::Ready), 510 * MS, 1);
        let expected = std::env::current_dir().unwrap().join("a.mp4");
        assert_eq!(
            outcome,
            LoadProgress::Ready {
                attempts: 2,
                resolved: expected.to_string_lossy().into_owned()
            }
        );
    }

    #[test]
    fn signals_for_other_generations_are_stale() {
        let mut renderer = Recorder::default();
        let mut loader = AssetLoader::new(RetryPolicy::default(), AssetRoot::default());
        loader.begin(&mut renderer, &video("a.mp4"), 7);
        assert_eq!(
            loader.on_signal(&signal(6, SignalKind::Ready), 0, 7),
            LoadProgress::Stale
        );
        assert!(loader.is_active());

        // The trial moved on while a retry was pending.
        loader.on_signal(&signal(7, SignalKind::Error("x".into())), 0, 7);
        assert_eq!(loader.poll(&mut renderer, 600 * MS, 8), LoadProgress::Stale);
        assert!(!loader.is_active());
        assert_eq!(renderer.presented.len(), 1);
    }
}
