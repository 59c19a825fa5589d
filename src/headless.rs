use crate::{Prepared, print_summary};
use anyhow::{Context, Result};
use cogex_core::TrialSpec;
use cogex_experiment::{Engine, EngineEvent, EnvironmentDescriptor, JsonFileTransmitter};
use cogex_render::HeadlessRenderer;
use cogex_timing::{HighPrecisionTimer, ManualTimer, Timer};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand::seq::IteratorRandom;
use std::time::Duration;
use tracing::{debug, info};

const RT_RANGE_MS: (u64, u64) = (250, 650);
const ERROR_RATE: f64 = 0.1;
/// Longest single sleep, so a session with no deadline pending still
/// re-checks its renderer.
const MAX_SLEEP: Duration = Duration::from_millis(50);

/// Stand-in participant: answers every trial that wants an answer, usually
/// correctly, after a uniformly drawn reaction time.
pub struct SimulatedSubject<R: Rng> {
    rng: R,
    pending: Option<(u64, String)>,
}

impl<R: Rng> SimulatedSubject<R> {
    pub fn new(rng: R) -> Self {
        Self { rng, pending: None }
    }

    pub fn on_onset(&mut self, spec: &TrialSpec, at_ns: u64) {
        self.pending = None;
        if !spec.expects_response() {
            return;
        }
        let wrong = self.rng.random_bool(ERROR_RATE);
        let symbol = match (&spec.expected, wrong) {
            (Some(expected), false) => Some(expected.clone()),
            (expected, _) => spec
                .valid_responses
                .iter()
                .filter(|s| Some(*s) != expected.as_ref())
                .choose(&mut self.rng)
                .cloned(),
        };
        let Some(symbol) = symbol else {
            return;
        };
        let rt = self.rng.random_range(RT_RANGE_MS.0..=RT_RANGE_MS.1);
        self.pending = Some((at_ns + rt * 1_000_000, symbol));
    }

    pub fn due(&mut self, now_ns: u64) -> Option<String> {
        if self.pending.as_ref().is_some_and(|(at, _)| *at <= now_ns) {
            self.pending.take().map(|(_, symbol)| symbol)
        } else {
            None
        }
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.pending.as_ref().map(|(at, _)| *at)
    }
}

type HeadlessEngine<T> = Engine<T, HeadlessRenderer<T>, StdRng, JsonFileTransmitter>;

pub fn run(prepared: Prepared, fast: bool) -> Result<()> {
    if fast {
        simulate(prepared, ManualTimer::new())
    } else {
        simulate(prepared, HighPrecisionTimer::new())
    }
}

fn start<T: Timer<Timestamp = u64>>(
    prepared: Prepared,
    timer: T,
    renderer: HeadlessRenderer<T>,
) -> Result<(HeadlessEngine<T>, SimulatedSubject<StdRng>)> {
    let Prepared {
        config,
        specs,
        mut rng,
        client,
        ..
    } = prepared;

    let subject = SimulatedSubject::new(StdRng::from_rng(&mut rng));
    let environment = EnvironmentDescriptor::detect().headless(true);
    let engine = Engine::new(&config, specs, timer, renderer, rng, client, environment)
        .context("starting the session")?;
    Ok((engine, subject))
}

fn simulate<T: Timer<Timestamp = u64>>(prepared: Prepared, timer: T) -> Result<()> {
    let renderer = HeadlessRenderer::new(timer.clone());
    let (mut engine, mut subject) = start(prepared, timer, renderer)?;
    info!(session = %engine.session().session_id, "headless session started");
    let events = engine.start();
    drive(&mut engine, &mut subject, events);

    let results = engine.finalize().trials.clone();
    print_summary(&results);
    Ok(())
}

/// Runs the session to its end, answering for the subject and sleeping until
/// the next deadline. Returns every event the engine emitted, in order.
fn drive<T: Timer<Timestamp = u64>>(
    engine: &mut HeadlessEngine<T>,
    subject: &mut SimulatedSubject<StdRng>,
    mut events: Vec<EngineEvent>,
) -> Vec<EngineEvent> {
    let mut log = Vec::new();
    loop {
        for event in events.drain(..) {
            match &event {
                EngineEvent::StimulusOnset { trial_id, at_ns } => {
                    if let Some(spec) = engine.current_trial().filter(|s| s.id == *trial_id) {
                        subject.on_onset(spec, *at_ns);
                    }
                }
                EngineEvent::TrialConcluded { trial_id, status } => {
                    let (done, total) = engine.progress();
                    debug!(trial_id, ?status, done, total, "trial concluded");
                }
                other => debug!(?other, "engine event"),
            }
            log.push(event);
        }
        if engine.is_finished() {
            return log;
        }

        let now = engine.timer().now();
        if let Some(symbol) = subject.due(now) {
            events = engine.handle_input(&symbol);
            continue;
        }

        let next = [
            engine.next_deadline(),
            engine.renderer().next_deadline(),
            subject.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min();
        let wait = next
            .map(|at| Duration::from_nanos(at.saturating_sub(now)))
            .unwrap_or(MAX_SLEEP)
            .min(MAX_SLEEP);
        engine.timer().sleep(wait);
        events = engine.update();
    }
}
