//! One trial at a time: load, adapt, onset delay, test, response window.
//!
//! Every transition is driven from outside, either by `tick` with the current
//! time, by a renderer signal or by subject input. The timeline holds the
//! deadlines; it never sleeps. A generation counter is bumped whenever a trial
//! begins or concludes, and any renderer signal carrying another generation is
//! dropped without effect.

use crate::loader::{AssetLoader, LoadProgress};
use crate::response::{ResponseOutcome, ResponseWindow};
use cogex_core::{
    AdaptCompletion, PresentedValues, RendererSignal, SignalKind, Stage, StimulusDescriptor,
    StimulusRenderer, Ticket, TrialPhase, TrialResult, TrialSpec, TrialStatus,
};
use rand::Rng;
use tracing::{debug, info, warn};

const NS_PER_MS: u64 = 1_000_000;

#[derive(Debug, Clone, PartialEq)]
pub enum TimelineEvent {
    AssetLoaded { trial_id: usize, attempts: u32 },
    StimulusOnset { trial_id: usize, at_ns: u64 },
    PrematureResponse { trial_id: usize, elapsed_ms: f64 },
    Concluded(Box<TrialResult>),
}

#[derive(Debug)]
struct LiveTrial {
    spec: TrialSpec,
    presented: StimulusDescriptor,
    onset_delay_ms: u64,
    retry_count: u32,
    adapt_until: Option<u64>,
    onset_at: Option<u64>,
    window: Option<ResponseWindow>,
    /// The trial's clip finished before the stimulus was shown.
    clip_ended: bool,
}

#[derive(Debug)]
struct Outcome {
    status: TrialStatus,
    response: Option<String>,
    rt_ms: Option<f64>,
    failure_reason: Option<String>,
}

impl Outcome {
    fn bare(status: TrialStatus) -> Self {
        Self {
            status,
            response: None,
            rt_ms: None,
            failure_reason: None,
        }
    }
}

/// Correctness of a concluded trial. `None` when there is nothing to score
/// against.
pub fn score(spec: &TrialSpec, status: TrialStatus, response: Option<&str>) -> Option<bool> {
    match status {
        TrialStatus::SkippedLoadFailure => None,
        TrialStatus::NaturalEndNoResponseRequired => Some(true),
        TrialStatus::Responded if !spec.expects_response() => Some(false),
        TrialStatus::Responded => spec.expected.as_deref().map(|e| Some(e) == response),
        TrialStatus::TimedOut => spec.expected.as_ref().map(|_| false),
    }
}

#[derive(Debug)]
pub struct TrialTimeline {
    generation: u64,
    phase: TrialPhase,
    live: Option<LiveTrial>,
    loader: AssetLoader,
    min_plausible_ms: u64,
    iti_until: Option<u64>,
}

impl TrialTimeline {
    pub fn new(loader: AssetLoader, min_plausible_ms: u64) -> Self {
        Self {
            generation: 0,
            phase: TrialPhase::Idle,
            live: None,
            loader,
            min_plausible_ms,
            iti_until: None,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn phase(&self) -> TrialPhase {
        self.phase
    }

    pub fn current_trial(&self) -> Option<&TrialSpec> {
        self.live.as_ref().map(|l| &l.spec)
    }

    pub fn begin<Rd, R>(
        &mut self,
        spec: TrialSpec,
        renderer: &mut Rd,
        rng: &mut R,
        now_ns: u64,
        events: &mut Vec<TimelineEvent>,
    ) where
        Rd: StimulusRenderer + ?Sized,
        R: Rng + ?Sized,
    {
        self.generation += 1;
        renderer.stop();
        self.loader.cancel();
        self.iti_until = None;

        let (lo, hi) = spec.timing.onset_delay_ms;
        let onset_delay_ms = if lo >= hi {
            lo
        } else {
            rng.random_range(lo..=hi)
        };
        let mut presented = spec.stimulus.clone();
        if presented.duration_ms.is_none() {
            presented.duration_ms = Some(spec.timing.stimulus_ms);
        }

        info!(
            trial = spec.id,
            condition = %spec.condition,
            practice = spec.is_practice,
            generation = self.generation,
            onset_delay_ms,
            "trial started"
        );

        let needs_asset = spec.needs_asset();
        self.live = Some(LiveTrial {
            spec,
            presented,
            onset_delay_ms,
            retry_count: 0,
            adapt_until: None,
            onset_at: None,
            window: None,
            clip_ended: false,
        });

        if needs_asset {
            self.phase = TrialPhase::Loading;
            let Some(live) = self.live.as_ref() else {
                return;
            };
            if let LoadProgress::Failed { attempts, reason } =
                self.loader.begin(renderer, &live.presented, self.generation)
            {
                self.skip(attempts, reason, renderer, now_ns, events);
            }
        } else {
            self.enter_presentation(renderer, now_ns);
        }
    }

    /// Advances through every transition whose deadline has passed.
    pub fn tick<Rd: StimulusRenderer + ?Sized>(
        &mut self,
        renderer: &mut Rd,
        now_ns: u64,
        events: &mut Vec<TimelineEvent>,
    ) {
        loop {
            match self.phase {
                TrialPhase::Idle => break,
                TrialPhase::Loading => {
                    self.loader.poll(renderer, now_ns, self.generation);
                    break;
                }
                TrialPhase::Adapting => {
                    let due = self
                        .live
                        .as_ref()
                        .and_then(|l| l.adapt_until)
                        .is_some_and(|t| now_ns >= t);
                    if !due {
                        break;
                    }
                    self.schedule_onset(now_ns);
                }
                TrialPhase::AwaitingOnset => {
                    let due = self
                        .live
                        .as_ref()
                        .and_then(|l| l.onset_at)
                        .is_some_and(|t| now_ns >= t);
                    if !due {
                        break;
                    }
                    self.fire_onset(renderer, now_ns, events);
                }
                TrialPhase::AwaitingResponse => {
                    let Some(live) = self.live.as_mut() else {
                        self.phase = TrialPhase::Idle;
                        break;
                    };
                    let expired = live
                        .window
                        .as_mut()
                        .is_some_and(|w| w.poll_expiry(now_ns));
                    if !expired {
                        break;
                    }
                    let status = if live.spec.expects_response() {
                        TrialStatus::TimedOut
                    } else {
                        TrialStatus::NaturalEndNoResponseRequired
                    };
                    self.conclude(Outcome::bare(status), renderer, now_ns, events);
                }
                TrialPhase::Concluding => {
                    if self.iti_until.is_some_and(|t| now_ns < t) {
                        break;
                    }
                    self.iti_until = None;
                    self.phase = TrialPhase::Idle;
                    break;
                }
            }
        }
    }

    pub fn handle_signal<Rd: StimulusRenderer + ?Sized>(
        &mut self,
        signal: &RendererSignal,
        renderer: &mut Rd,
        now_ns: u64,
        events: &mut Vec<TimelineEvent>,
    ) {
        if signal.ticket.generation != self.generation {
            debug!(
                signal_generation = signal.ticket.generation,
                live_generation = self.generation,
                "dropping stale renderer signal"
            );
            return;
        }

        if self.phase == TrialPhase::Loading {
            match self.loader.on_signal(signal, now_ns, self.generation) {
                LoadProgress::Ready { attempts, resolved } => {
                    if let Some(live) = self.live.as_mut() {
                        live.presented.asset = Some(resolved);
                        live.retry_count = attempts;
                        events.push(TimelineEvent::AssetLoaded {
                            trial_id: live.spec.id,
                            attempts,
                        });
                    }
                    self.enter_presentation(renderer, now_ns);
                }
                LoadProgress::Failed { attempts, reason } => {
                    self.skip(attempts, reason, renderer, now_ns, events)
                }
                LoadProgress::Pending | LoadProgress::Stale => {}
            }
            return;
        }

        if !self.phase.listens_to_renderer() && self.phase != TrialPhase::AwaitingOnset {
            return;
        }

        match &signal.kind {
            SignalKind::Error(reason) => {
                warn!(
                    generation = self.generation,
                    stage = ?signal.ticket.stage,
                    %reason,
                    "renderer error during presentation"
                );
            }
            SignalKind::Ready => {}
            SignalKind::Ended => {
                let Some(live) = self.live.as_ref() else {
                    return;
                };
                let catch = !live.spec.expects_response();
                let has_asset = live.spec.needs_asset();
                let ends_adapt = live.spec.timing.adapt_completion == AdaptCompletion::RendererEnded;

                match (self.phase, signal.ticket.stage) {
                    (TrialPhase::Adapting, Stage::Adapt) if ends_adapt => {
                        self.schedule_onset(now_ns)
                    }
                    (TrialPhase::AwaitingResponse, Stage::Load) if catch && has_asset => self
                        .conclude(
                            Outcome::bare(TrialStatus::NaturalEndNoResponseRequired),
                            renderer,
                            now_ns,
                            events,
                        ),
                    (phase, Stage::Load) if catch && has_asset => {
                        debug!(%phase, "clip ended before onset; trial ends once shown");
                        if let Some(live) = self.live.as_mut() {
                            live.clip_ended = true;
                        }
                    }
                    (TrialPhase::AwaitingResponse, Stage::Test) if catch && !has_asset => self
                        .conclude(
                            Outcome::bare(TrialStatus::NaturalEndNoResponseRequired),
                            renderer,
                            now_ns,
                            events,
                        ),
                    (phase, stage) => {
                        debug!(%phase, ?stage, "renderer end signal does not end this trial")
                    }
                }
            }
        }
    }

    pub fn handle_input<Rd: StimulusRenderer + ?Sized>(
        &mut self,
        symbol: &str,
        renderer: &mut Rd,
        now_ns: u64,
        events: &mut Vec<TimelineEvent>,
    ) {
        if !self.phase.allows_input() {
            debug!(symbol, phase = %self.phase, "input outside a response window ignored");
            return;
        }
        let Some(live) = self.live.as_mut() else {
            return;
        };
        let trial_id = live.spec.id;
        let Some(window) = live.window.as_mut() else {
            return;
        };

        match window.offer(symbol, now_ns) {
            ResponseOutcome::Accepted { symbol, rt_ms } => {
                let outcome = Outcome {
                    status: TrialStatus::Responded,
                    response: Some(symbol),
                    rt_ms: Some(rt_ms),
                    failure_reason: None,
                };
                self.conclude(outcome, renderer, now_ns, events);
            }
            ResponseOutcome::Premature { elapsed_ms } => {
                debug!(trial = trial_id, symbol, elapsed_ms, "implausibly fast response ignored");
                events.push(TimelineEvent::PrematureResponse {
                    trial_id,
                    elapsed_ms,
                });
            }
            ResponseOutcome::NotQualifying => {
                debug!(trial = trial_id, symbol, "input is not a valid response")
            }
            ResponseOutcome::Closed => {}
        }
    }

    /// Earliest instant at which `tick` has something to do.
    pub fn next_deadline(&self) -> Option<u64> {
        let live = self.live.as_ref();
        match self.phase {
            TrialPhase::Idle => None,
            TrialPhase::Loading => self.loader.next_deadline(),
            TrialPhase::Adapting => live.and_then(|l| l.adapt_until),
            TrialPhase::AwaitingOnset => live.and_then(|l| l.onset_at),
            TrialPhase::AwaitingResponse => {
                live.and_then(|l| l.window.as_ref()).and_then(|w| w.expires_at())
            }
            TrialPhase::Concluding => self.iti_until,
        }
    }

    fn enter_presentation<Rd: StimulusRenderer + ?Sized>(&mut self, renderer: &mut Rd, now_ns: u64) {
        let generation = self.generation;
        let Some(live) = self.live.as_mut() else {
            self.phase = TrialPhase::Idle;
            return;
        };
        if !live.spec.has_adapt_stage() {
            self.schedule_onset(now_ns);
            return;
        }
        renderer.present(
            &live.presented,
            Ticket {
                generation,
                stage: Stage::Adapt,
            },
        );
        live.adapt_until = match live.spec.timing.adapt_completion {
            AdaptCompletion::Timer => Some(now_ns + live.spec.timing.adapt_ms * NS_PER_MS),
            AdaptCompletion::RendererEnded => None,
        };
        debug!(trial = live.spec.id, generation, "adaptation started");
        self.phase = TrialPhase::Adapting;
    }

    fn schedule_onset(&mut self, now_ns: u64) {
        let Some(live) = self.live.as_mut() else {
            self.phase = TrialPhase::Idle;
            return;
        };
        live.adapt_until = None;
        live.onset_at = Some(now_ns + live.onset_delay_ms * NS_PER_MS);
        self.phase = TrialPhase::AwaitingOnset;
    }

    fn fire_onset<Rd: StimulusRenderer + ?Sized>(
        &mut self,
        renderer: &mut Rd,
        now_ns: u64,
        events: &mut Vec<TimelineEvent>,
    ) {
        let generation = self.generation;
        let Some(live) = self.live.as_mut() else {
            self.phase = TrialPhase::Idle;
            return;
        };
        renderer.present(
            &live.presented,
            Ticket {
                generation,
                stage: Stage::Test,
            },
        );
        let window_ms = live.spec.timing.window_ms;
        live.onset_at = None;
        live.window = Some(ResponseWindow::open(
            live.spec.valid_responses.clone(),
            now_ns,
            window_ms,
            self.min_plausible_ms,
        ));
        self.phase = TrialPhase::AwaitingResponse;
        debug!(trial = live.spec.id, generation, at_ns = now_ns, "stimulus onset");
        events.push(TimelineEvent::StimulusOnset {
            trial_id: live.spec.id,
            at_ns: now_ns,
        });

        // A catch trial with nothing left to wait for ends as soon as it is
        // shown.
        let clip_done = live.spec.needs_asset() && live.clip_ended;
        let no_wait = window_ms == 0 && !live.spec.needs_asset();
        if !live.spec.expects_response() && (clip_done || no_wait) {
            self.conclude(
                Outcome::bare(TrialStatus::NaturalEndNoResponseRequired),
                renderer,
                now_ns,
                events,
            );
        }
    }

    fn skip<Rd: StimulusRenderer + ?Sized>(
        &mut self,
        attempts: u32,
        reason: String,
        renderer: &mut Rd,
        now_ns: u64,
        events: &mut Vec<TimelineEvent>,
    ) {
        if let Some(live) = self.live.as_mut() {
            live.retry_count = attempts;
        }
        let outcome = Outcome {
            failure_reason: Some(reason),
            ..Outcome::bare(TrialStatus::SkippedLoadFailure)
        };
        self.conclude(outcome, renderer, now_ns, events);
    }

    fn conclude<Rd: StimulusRenderer + ?Sized>(
        &mut self,
        outcome: Outcome,
        renderer: &mut Rd,
        now_ns: u64,
        events: &mut Vec<TimelineEvent>,
    ) {
        renderer.stop();
        self.loader.cancel();
        let Some(live) = self.live.take() else {
            self.phase = TrialPhase::Idle;
            return;
        };

        let correct = score(&live.spec, outcome.status, outcome.response.as_deref());
        let inter_trial_ms = live.spec.timing.inter_trial_ms;
        let result = TrialResult {
            trial_id: live.spec.id,
            condition: live.spec.condition,
            is_practice: live.spec.is_practice,
            presented_values: PresentedValues {
                stimulus: live.presented,
                onset_delay_ms: live.onset_delay_ms,
            },
            response: outcome.response,
            reaction_time_ms: outcome.rt_ms,
            correct,
            status: outcome.status,
            retry_count: live.retry_count,
            failure_reason: outcome.failure_reason,
            concluded_at_ns: now_ns,
        };

        info!(
            trial = result.trial_id,
            generation = self.generation,
            status = ?result.status,
            rt_ms = ?result.reaction_time_ms,
            correct = ?result.correct,
            retries = result.retry_count,
            "trial concluded"
        );

        self.generation += 1;
        self.phase = TrialPhase::Concluding;
        self.iti_until = Some(now_ns + inter_trial_ms * NS_PER_MS);
        events.push(TimelineEvent::Concluded(Box::new(result)));
    }
}
