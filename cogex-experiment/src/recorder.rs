use crate::error::TransmitError;
use crate::session::{SessionMeta, SessionPayload};
use chrono::Utc;
use cogex_core::TrialResult;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Delivers a finished session somewhere durable. Called at most once per
/// session; a failure is logged and never retried.
pub trait TransmissionClient {
    fn send(&mut self, payload: &SessionPayload) -> Result<(), TransmitError>;
}

impl<C: TransmissionClient + ?Sized> TransmissionClient for Box<C> {
    fn send(&mut self, payload: &SessionPayload) -> Result<(), TransmitError> {
        (**self).send(payload)
    }
}

/// Writes `<session-id>.json` into a directory. An existing file is never
/// overwritten; the payload goes to `<session-id>.01.json`, `.02`, ... instead.
#[derive(Debug, Clone)]
pub struct JsonFileTransmitter {
    dir: PathBuf,
}

const MAX_SUFFIX: u32 = 99;

impl JsonFileTransmitter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn candidate(&self, session_id: &str, suffix: u32) -> PathBuf {
        if suffix == 0 {
            self.dir.join(format!("{session_id}.json"))
        } else {
            self.dir.join(format!("{session_id}.{suffix:02}.json"))
        }
    }
}

impl TransmissionClient for JsonFileTransmitter {
    fn send(&mut self, payload: &SessionPayload) -> Result<(), TransmitError> {
        std::fs::create_dir_all(&self.dir)?;
        let body = serde_json::to_string_pretty(payload)?;
        let session_id = payload.session.session_id.to_string();

        for suffix in 0..=MAX_SUFFIX {
            let path = self.candidate(&session_id, suffix);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(body.as_bytes())?;
                    info!(path = %path.display(), trials = payload.trials.len(), "session written");
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(std::io::Error::new(
            ErrorKind::AlreadyExists,
            format!("no free file name for session {session_id}"),
        )
        .into())
    }
}

/// Accumulates trial results for one session and hands them to the
/// transmission client exactly once.
///
/// Results appended after `finalize` are dropped with a warning; the
/// finalized payload never changes.
pub struct SessionRecorder<C: TransmissionClient> {
    meta: SessionMeta,
    trials: Vec<TrialResult>,
    client: C,
    finalized: Option<SessionPayload>,
}

impl<C: TransmissionClient> SessionRecorder<C> {
    pub fn start(meta: SessionMeta, client: C) -> Self {
        info!(
            session = %meta.session_id,
            experiment = %meta.experiment_name,
            cohort = %meta.cohort,
            main_trials = meta.trial_counts.main,
            practice_trials = meta.trial_counts.practice,
            "session started"
        );
        Self {
            meta,
            trials: Vec::new(),
            client,
            finalized: None,
        }
    }

    pub fn append(&mut self, result: TrialResult) {
        if self.finalized.is_some() {
            warn!(trial = result.trial_id, "session already finalized; result discarded");
            return;
        }
        self.trials.push(result);
    }

    pub fn finalize(&mut self) -> &SessionPayload {
        let meta = &self.meta;
        let trials = &mut self.trials;
        let client = &mut self.client;
        self.finalized.get_or_insert_with(|| {
            let mut session = meta.clone();
            session.ended_at = Some(Utc::now());
            let payload = SessionPayload {
                session,
                trials: std::mem::take(trials),
            };
            match client.send(&payload) {
                Ok(()) => info!(
                    session = %payload.session.session_id,
                    trials = payload.trials.len(),
                    "session transmitted"
                ),
                Err(e) => warn!(
                    session = %payload.session.session_id,
                    error = %e,
                    "session transmission failed; results remain in memory"
                ),
            }
            payload
        })
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.is_some()
    }

    pub fn trials(&self) -> &[TrialResult] {
        match &self.finalized {
            Some(payload) => &payload.trials,
            None => &self.trials,
        }
    }

    pub fn meta(&self) -> &SessionMeta {
        &self.meta
    }

    pub fn client(&self) -> &C {
        &self.client
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExperimentConfig;
    use crate::session::{EnvironmentDescriptor, TrialCounts};
    use cogex_core::{PresentedValues, StimulusDescriptor, StimulusKind, TrialStatus};

    #[derive(Default)]
    struct Counting {
        sends: usize,
        fail: bool,
    }

    impl TransmissionClient for Counting {
        fn send(&mut self, _payload: &SessionPayload) -> Result<(), TransmitError> {
            self.sends += 1;
            if self.fail {
                Err(std::io::Error::other("network down").into())
            } else {
                Ok(())
            }
        }
    }

    fn meta() -> SessionMeta {
        SessionMeta::new(
            &ExperimentConfig::default(),
            EnvironmentDescriptor::default(),
            TrialCounts { main: 2, practice: 0 },
        )
    }

    fn result(id: usize) -> TrialResult {
        TrialResult {
            trial_id: id,
            condition: "congruent".into(),
            is_practice: false,
            presented_values: PresentedValues {
                stimulus: StimulusDescriptor::new(StimulusKind::Blank),
                onset_delay_ms: 0,
            },
            response: None,
            reaction_time_ms: None,
            correct: None,
            status: TrialStatus::TimedOut,
            retry_count: 0,
            failure_reason: None,
            concluded_at_ns: id as u64,
        }
    }

    #[test]
    fn finalize_sends_once_and_freezes() {
        let mut recorder = SessionRecorder::start(meta(), Counting::default());
        recorder.append(result(0));
        recorder.append(result(1));

        let first = recorder.finalize().clone();
        assert_eq!(first.trials.len(), 2);
        assert!(first.session.ended_at.is_some());

        recorder.append(result(2));
        let second = recorder.finalize().clone();
        assert_eq!(first, second);
        assert_eq!(recorder.client().sends, 1);
        assert_eq!(recorder.trials().len(), 2);
    }

    #[test]
    fn failed_transmission_keeps_the_payload() {
        let client = Counting {
            fail: true,
            ..Counting::default()
        };
        let mut recorder = SessionRecorder::start(meta(), client);
        recorder.append(result(0));
        assert_eq!(recorder.finalize().trials.len(), 1);
        recorder.finalize();
        assert_eq!(recorder.client().sends, 1);
        assert!(recorder.is_finalized());
    }

    #[test]
    fn json_files_never_overwrite() {
        let dir = std::env::temp_dir().join(format!("cogex-recorder-{}", uuid::Uuid::new_v4()));
        let mut transmitter = JsonFileTransmitter::new(&dir);
        let payload = SessionPayload {
            session: meta(),
            trials: vec![result(0)],
        };

        transmitter.send(&payload).unwrap();
        transmitter.send(&payload).unwrap();

        let id = payload.session.session_id.to_string();
        let first = dir.join(format!("{id}.json"));
        let second = dir.join(format!("{id}.01.json"));
        assert!(first.exists());
        assert!(second.exists());

        let text = std::fs::read_to_string(&first).unwrap();
        let back: SessionPayload = serde_json::from_str(&text).unwrap();
        assert_eq!(back.trials.len(), 1);
        assert_eq!(back.session.session_id, payload.session.session_id);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
