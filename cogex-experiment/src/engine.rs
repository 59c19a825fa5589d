use crate::config::ExperimentConfig;
use crate::error::EngineError;
use crate::loader::{AssetLoader, AssetRoot};
use crate::recorder::{SessionRecorder, TransmissionClient};
use crate::session::{EnvironmentDescriptor, SessionMeta, SessionPayload, TrialCounts};
use crate::timeline::{TimelineEvent, TrialTimeline};
use cogex_core::{SessionPhase, StimulusRenderer, TrialPhase, TrialResult, TrialSpec, TrialStatus};
use cogex_timing::Timer;
use rand::Rng;
use tracing::{info, warn};

/// Upper bound on transition passes per `update`, so a renderer that answers
/// every `present` instantly cannot spin the loop forever.
const MAX_SETTLE_PASSES: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    TrialStarted {
        trial_id: usize,
        condition: String,
        is_practice: bool,
    },
    AssetLoaded {
        trial_id: usize,
        attempts: u32,
    },
    StimulusOnset {
        trial_id: usize,
        at_ns: u64,
    },
    PrematureResponse {
        trial_id: usize,
        elapsed_ms: f64,
    },
    TrialConcluded {
        trial_id: usize,
        status: TrialStatus,
    },
    SessionFinished,
}

pub struct Engine<T, Rd, R, C>
where
    T: Timer<Timestamp = u64>,
    Rd: StimulusRenderer,
    R: Rng,
    C: TransmissionClient,
{
    timer: T,
    renderer: Rd,
    rng: R,
    specs: Vec<TrialSpec>,
    next_index: usize,
    timeline: TrialTimeline,
    recorder: SessionRecorder<C>,
    phase: SessionPhase,
}

impl<T, Rd, R, C> Engine<T, Rd, R, C>
where
    T: Timer<Timestamp = u64>,
    Rd: StimulusRenderer,
    R: Rng,
    C: TransmissionClient,
{
    /// Checks everything that can be checked before the first trial. Any
    /// failure here is fatal; once this returns `Ok`, nothing else stops the
    /// session.
    pub fn new(
        config: &ExperimentConfig,
        specs: Vec<TrialSpec>,
        timer: T,
        renderer: Rd,
        rng: R,
        client: C,
        environment: EnvironmentDescriptor,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        validate_specs(&specs)?;
        renderer.check_surface()?;
        let root = AssetRoot::new(config.asset_root.clone())?;

        let practice = specs.iter().filter(|s| s.is_practice).count();
        let counts = TrialCounts {
            main: specs.len() - practice,
            practice,
        };
        let meta = SessionMeta::new(config, environment, counts);
        let recorder = SessionRecorder::start(meta, client);
        let timeline = TrialTimeline::new(
            AssetLoader::new(config.retry_policy(), root),
            config.min_plausible_ms,
        );

        Ok(Self {
            timer,
            renderer,
            rng,
            specs,
            next_index: 0,
            timeline,
            recorder,
            phase: SessionPhase::Ready,
        })
    }

    pub fn start(&mut self) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        if self.phase != SessionPhase::Ready {
            return events;
        }
        self.phase = SessionPhase::Running;
        self.begin_next(&mut events);
        self.settle(&mut events);
        events
    }

    /// Processes renderer signals and every deadline that has passed.
    pub fn update(&mut self) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        self.settle(&mut events);
        events
    }

    pub fn handle_input(&mut self, symbol: &str) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        if self.phase != SessionPhase::Running {
            return events;
        }
        let mut raw = Vec::new();
        let now = self.timer.now();
        self.timeline
            .handle_input(symbol, &mut self.renderer, now, &mut raw);
        self.absorb(raw, &mut events);
        self.settle(&mut events);
        events
    }

    /// Ends the session and hands the payload to the transmission client.
    /// Calling it again returns the same payload without sending anything.
    pub fn finalize(&mut self) -> &SessionPayload {
        if self.phase != SessionPhase::Finished {
            if self.phase == SessionPhase::Running {
                warn!(
                    completed = self.recorder.trials().len(),
                    total = self.specs.len(),
                    "session ended before the last trial"
                );
            }
            self.phase = SessionPhase::Finished;
            self.renderer.stop();
        }
        self.recorder.finalize()
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.timeline.next_deadline()
    }

    pub fn is_finished(&self) -> bool {
        self.phase == SessionPhase::Finished
    }

    pub fn session_phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn current_phase(&self) -> TrialPhase {
        self.timeline.phase()
    }

    pub fn current_trial(&self) -> Option<&TrialSpec> {
        self.timeline.current_trial()
    }

    /// `(concluded, total)`
    pub fn progress(&self) -> (usize, usize) {
        (self.recorder.trials().len(), self.specs.len())
    }

    pub fn results(&self) -> &[TrialResult] {
        self.recorder.trials()
    }

    pub fn session(&self) -> &SessionMeta {
        self.recorder.meta()
    }

    pub fn timer(&self) -> &T {
        &self.timer
    }

    pub fn timer_mut(&mut self) -> &mut T {
        &mut self.timer
    }

    pub fn renderer(&self) -> &Rd {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut Rd {
        &mut self.renderer
    }

    pub fn client(&self) -> &C {
        self.recorder.client()
    }

    fn settle(&mut self, events: &mut Vec<EngineEvent>) {
        for _ in 0..MAX_SETTLE_PASSES {
            if self.phase != SessionPhase::Running {
                return;
            }
            let before = (self.timeline.phase(), self.timeline.generation());
            let mut raw = Vec::new();

            let mut signals = self.drain_signals(&mut raw);
            let now = self.timer.now();
            self.timeline.tick(&mut self.renderer, now, &mut raw);
            signals += self.drain_signals(&mut raw);
            self.absorb(raw, events);

            if self.timeline.phase() == TrialPhase::Idle {
                self.begin_next(events);
                continue;
            }
            let after = (self.timeline.phase(), self.timeline.generation());
            if signals == 0 && before == after {
                return;
            }
        }
    }

    fn drain_signals(&mut self, raw: &mut Vec<TimelineEvent>) -> usize {
        let mut count = 0;
        while let Some(signal) = self.renderer.poll_signal() {
            count += 1;
            let now = self.timer.now();
            self.timeline
                .handle_signal(&signal, &mut self.renderer, now, raw);
        }
        count
    }

    fn begin_next(&mut self, events: &mut Vec<EngineEvent>) {
        let Some(spec) = self.specs.get(self.next_index).cloned() else {
            self.finish(events);
            return;
        };
        self.next_index += 1;
        events.push(EngineEvent::TrialStarted {
            trial_id: spec.id,
            condition: spec.condition.clone(),
            is_practice: spec.is_practice,
        });
        let mut raw = Vec::new();
        let now = self.timer.now();
        self.timeline
            .begin(spec, &mut self.renderer, &mut self.rng, now, &mut raw);
        self.absorb(raw, events);
    }

    fn absorb(&mut self, raw: Vec<TimelineEvent>, events: &mut Vec<EngineEvent>) {
        for event in raw {
            events.push(match event {
                TimelineEvent::AssetLoaded { trial_id, attempts } => {
                    EngineEvent::AssetLoaded { trial_id, attempts }
                }
                TimelineEvent::StimulusOnset { trial_id, at_ns } => {
                    EngineEvent::StimulusOnset { trial_id, at_ns }
                }
                TimelineEvent::PrematureResponse {
                    trial_id,
                    elapsed_ms,
                } => EngineEvent::PrematureResponse {
                    trial_id,
                    elapsed_ms,
                },
                TimelineEvent::Concluded(result) => {
                    let (trial_id, status) = (result.trial_id, result.status);
                    self.recorder.append(*result);
                    EngineEvent::TrialConcluded { trial_id, status }
                }
            });
        }
    }

    fn finish(&mut self, events: &mut Vec<EngineEvent>) {
        self.phase = SessionPhase::Finished;
        self.renderer.stop();
        let payload = self.recorder.finalize();
        info!(
            session = %payload.session.session_id,
            trials = payload.trials.len(),
            "session finished"
        );
        events.push(EngineEvent::SessionFinished);
    }
}

fn validate_specs(specs: &[TrialSpec]) -> Result<(), EngineError> {
    if specs.is_empty() {
        return Err(EngineError::EmptySession);
    }
    for (position, spec) in specs.iter().enumerate() {
        if spec.id != position {
            return Err(EngineError::TrialOrder {
                position,
                found: spec.id,
            });
        }
        let (min, max) = spec.timing.onset_delay_ms;
        if min > max {
            return Err(EngineError::InvalidTrial {
                id: spec.id,
                reason: format!("onset delay range {min}..{max} is inverted"),
            });
        }
        if spec.expects_response() && spec.timing.window_ms == 0 {
            return Err(EngineError::InvalidTrial {
                id: spec.id,
                reason: "a response is expected but the window is empty".to_string(),
            });
        }
        if let Some(expected) = &spec.expected {
            if !spec.valid_responses.contains(expected) {
                return Err(EngineError::InvalidTrial {
                    id: spec.id,
                    reason: format!("expected response '{expected}' is not a valid response"),
                });
            }
        }
    }
    Ok(())
}
