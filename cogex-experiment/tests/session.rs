use cogex_core::{
    RenderError, RendererSignal, SignalKind, Stage, StimulusDescriptor, StimulusKind,
    StimulusRenderer, Ticket, TrialPhase, TrialSpec, TrialStatus, TrialTiming,
};
use cogex_experiment::{
    Engine, EngineError, EngineEvent, EnvironmentDescriptor, ExperimentConfig, ProtocolKind,
    SessionPayload, TransmissionClient, TransmitError,
};
use cogex_timing::{ManualTimer, Timer};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::cell::Cell;
use std::collections::{BTreeSet, VecDeque};
use std::path::PathBuf;
use std::rc::Rc;

/// Answers every load request from a script (default `Ready`) and lets the
/// test inject any other signal by hand.
struct ScriptedRenderer {
    clock: ManualTimer,
    load_answers: VecDeque<SignalKind>,
    outbox: VecDeque<RendererSignal>,
    presented: Vec<(u64, Ticket, StimulusDescriptor)>,
    stops: usize,
    surface_ok: bool,
}

impl ScriptedRenderer {
    fn new(clock: ManualTimer) -> Self {
        Self {
            clock,
            load_answers: VecDeque::new(),
            outbox: VecDeque::new(),
            presented: Vec::new(),
            stops: 0,
            surface_ok: true,
        }
    }

    fn inject(&mut self, generation: u64, stage: Stage, kind: SignalKind) {
        self.outbox.push_back(RendererSignal {
            ticket: Ticket { generation, stage },
            kind,
        });
    }

    fn last_ticket(&self) -> Ticket {
        self.presented.last().map(|(_, t, _)| *t).unwrap()
    }

    fn presented_at(&self, stage: Stage) -> Vec<u64> {
        self.presented
            .iter()
            .filter(|(_, t, _)| t.stage == stage)
            .map(|(at, _, _)| *at)
            .collect()
    }
}

impl StimulusRenderer for ScriptedRenderer {
    fn present(&mut self, descriptor: &StimulusDescriptor, ticket: Ticket) {
        self.presented
            .push((self.clock.now(), ticket, descriptor.clone()));
        if ticket.stage == Stage::Load {
            let kind = self.load_answers.pop_front().unwrap_or(SignalKind::Ready);
            self.outbox.push_back(RendererSignal { ticket, kind });
        }
    }

    fn stop(&mut self) {
        self.stops += 1;
    }

    fn poll_signal(&mut self) -> Option<RendererSignal> {
        self.outbox.pop_front()
    }

    fn check_surface(&self) -> Result<(), RenderError> {
        if self.surface_ok {
            Ok(())
        } else {
            Err(RenderError::SurfaceMissing("no window".into()))
        }
    }
}

#[derive(Clone, Default)]
struct CountingClient {
    sends: Rc<Cell<usize>>,
}

impl TransmissionClient for CountingClient {
    fn send(&mut self, _payload: &SessionPayload) -> Result<(), TransmitError> {
        self.sends.set(self.sends.get() + 1);
        Ok(())
    }
}

type TestEngine = Engine<ManualTimer, ScriptedRenderer, StdRng, CountingClient>;

struct Harness {
    engine: TestEngine,
    clock: ManualTimer,
    sends: Rc<Cell<usize>>,
    events: Vec<EngineEvent>,
}

impl Harness {
    fn new(specs: Vec<TrialSpec>) -> Self {
        Self::with_config(&ExperimentConfig::default(), specs)
    }

    fn with_config(config: &ExperimentConfig, specs: Vec<TrialSpec>) -> Self {
        let clock = ManualTimer::new();
        let client = CountingClient::default();
        let sends = client.sends.clone();
        let engine = Engine::new(
            config,
            specs,
            clock.clone(),
            ScriptedRenderer::new(clock.clone()),
            StdRng::seed_from_u64(11),
            client,
            EnvironmentDescriptor::default().headless(true),
        )
        .unwrap();
        Self {
            engine,
            clock,
            sends,
            events: Vec::new(),
        }
    }

    fn start(&mut self) {
        let events = self.engine.start();
        self.events.extend(events);
    }

    fn at(&mut self, ms: u64) {
        let now_ms = self.clock.now() / 1_000_000;
        assert!(ms >= now_ms, "time runs forward");
        self.clock.advance_ms(ms - now_ms);
        let events = self.engine.update();
        self.events.extend(events);
    }

    fn press(&mut self, symbol: &str) {
        let events = self.engine.handle_input(symbol);
        self.events.extend(events);
    }

    fn inject(&mut self, generation: u64, stage: Stage, kind: SignalKind) {
        self.engine.renderer_mut().inject(generation, stage, kind);
    }
}

fn symbols(list: &[&str]) -> BTreeSet<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn motion(id: usize) -> TrialSpec {
    TrialSpec {
        id,
        condition: "congruent".into(),
        stimulus: StimulusDescriptor::new(StimulusKind::Fixation),
        valid_responses: symbols(&["left", "right"]),
        expected: Some("left".into()),
        timing: TrialTiming {
            onset_delay_ms: (500, 500),
            window_ms: 2000,
            inter_trial_ms: 1000,
            ..TrialTiming::default()
        },
        is_practice: false,
    }
}

fn video(id: usize, catch: bool) -> TrialSpec {
    TrialSpec {
        id,
        condition: if catch { "neutral_catch" } else { "congruent_hard" }.into(),
        stimulus: StimulusDescriptor::new(StimulusKind::Blank).with_asset("clip.mp4"),
        valid_responses: if catch {
            BTreeSet::new()
        } else {
            symbols(&["hard", "soft"])
        },
        expected: if catch { None } else { Some("hard".into()) },
        timing: TrialTiming {
            onset_delay_ms: (1000, 1000),
            window_ms: if catch { 0 } else { 2000 },
            inter_trial_ms: 1000,
            ..TrialTiming::default()
        },
        is_practice: false,
    }
}

#[test]
fn valid_response_is_recorded_with_reaction_time() {
    let mut h = Harness::new(vec![motion(0)]);
    h.start();
    assert_eq!(h.engine.current_phase(), TrialPhase::AwaitingOnset);
    h.at(500);
    assert_eq!(h.engine.current_phase(), TrialPhase::AwaitingResponse);
    h.clock.advance_ms(450);
    h.press("left");

    let result = &h.engine.results()[0];
    assert_eq!(result.status, TrialStatus::Responded);
    assert_eq!(result.response.as_deref(), Some("left"));
    assert_eq!(result.reaction_time_ms, Some(450.0));
    assert_eq!(result.correct, Some(true));
    assert_eq!(result.retry_count, 0);

    h.at(1949);
    assert!(!h.engine.is_finished());
    h.at(1950);
    assert!(h.engine.is_finished());
    assert_eq!(h.events.last(), Some(&EngineEvent::SessionFinished));
    assert_eq!(h.sends.get(), 1);
}

#[test]
fn premature_response_is_ignored_and_window_stays_open() {
    let mut h = Harness::new(vec![motion(0)]);
    h.start();
    h.at(500);
    h.clock.advance_ms(100);
    h.press("right");
    assert!(h.engine.results().is_empty());
    assert!(
        h.events
            .iter()
            .any(|e| matches!(e, EngineEvent::PrematureResponse { .. }))
    );

    h.clock.advance_ms(200);
    h.press("right");
    let result = &h.engine.results()[0];
    assert_eq!(result.reaction_time_ms, Some(300.0));
    assert_eq!(result.correct, Some(false));
}

#[test]
fn input_outside_the_window_changes_nothing() {
    let mut h = Harness::new(vec![motion(0)]);
    h.start();
    h.clock.advance_ms(100);
    h.press("left");
    assert!(h.engine.results().is_empty());
    assert_eq!(h.engine.current_phase(), TrialPhase::AwaitingOnset);
}

#[test]
fn silence_times_out() {
    let mut h = Harness::new(vec![motion(0)]);
    h.start();
    h.at(500);
    h.at(2499);
    assert!(h.engine.results().is_empty());
    h.at(2500);
    let result = &h.engine.results()[0];
    assert_eq!(result.status, TrialStatus::TimedOut);
    assert_eq!(result.response, None);
    assert_eq!(result.correct, Some(false));

    // A press after the window closed is not a response.
    h.press("left");
    assert_eq!(h.engine.results().len(), 1);
}

#[test]
fn failing_asset_is_retried_then_skipped() {
    let mut h = Harness::new(vec![video(0, false), motion(1)]);
    h.engine.renderer_mut().load_answers = VecDeque::from(vec![
        SignalKind::Error("404".into()),
        SignalKind::Error("404".into()),
        SignalKind::Error("404".into()),
    ]);
    h.start();
    for ms in [0, 250, 500, 750, 1000] {
        h.at(ms);
    }

    let loads = h.engine.renderer().presented_at(Stage::Load);
    assert_eq!(loads.len(), 3);
    for pair in loads.windows(2) {
        assert!(pair[1] - pair[0] >= 500 * 1_000_000);
    }

    let result = &h.engine.results()[0];
    assert_eq!(result.status, TrialStatus::SkippedLoadFailure);
    assert_eq!(result.retry_count, 3);
    assert_eq!(result.correct, None);
    assert_eq!(result.failure_reason.as_deref(), Some("404"));
    assert!(h.engine.renderer().presented_at(Stage::Test).is_empty());

    // The session carries on with the next trial after the interval.
    h.at(2000);
    assert_eq!(h.engine.current_trial().map(|s| s.id), Some(1));
}

#[test]
fn asset_recovers_on_second_attempt() {
    let mut h = Harness::new(vec![video(0, false)]);
    h.engine.renderer_mut().load_answers = VecDeque::from(vec![SignalKind::Error("timeout".into())]);
    h.start();
    h.at(0);
    h.at(500);
    assert!(
        h.events
            .contains(&EngineEvent::AssetLoaded { trial_id: 0, attempts: 2 })
    );
    h.at(1500);
    assert_eq!(h.engine.current_phase(), TrialPhase::AwaitingResponse);
    h.clock.advance_ms(600);
    h.press("hard");
    let result = &h.engine.results()[0];
    assert_eq!(result.retry_count, 2);
    assert_eq!(result.correct, Some(true));
    assert_eq!(result.reaction_time_ms, Some(600.0));
}

#[test]
fn catch_trial_ends_with_the_video() {
    let mut h = Harness::new(vec![video(0, true)]);
    h.start();
    h.at(1000);
    assert_eq!(h.engine.current_phase(), TrialPhase::AwaitingResponse);
    h.at(30_000);
    assert!(h.engine.results().is_empty());

    let generation = h.engine.renderer().last_ticket().generation;
    h.inject(generation, Stage::Load, SignalKind::Ended);
    h.at(30_000);
    let result = &h.engine.results()[0];
    assert_eq!(result.status, TrialStatus::NaturalEndNoResponseRequired);
    assert_eq!(result.correct, Some(true));
    assert_eq!(result.response, None);
}

#[test]
fn clip_ending_before_onset_still_shows_the_cue() {
    let mut h = Harness::new(vec![video(0, true)]);
    h.start();
    let generation = h.engine.renderer().last_ticket().generation;
    h.at(400);
    h.inject(generation, Stage::Load, SignalKind::Ended);
    h.at(500);
    assert!(h.engine.results().is_empty());
    assert_eq!(h.engine.current_phase(), TrialPhase::AwaitingOnset);
    assert!(h.engine.renderer().presented_at(Stage::Test).is_empty());

    h.at(1000);
    assert_eq!(
        h.engine.renderer().presented_at(Stage::Test),
        vec![1000 * 1_000_000]
    );
    let onset = h
        .events
        .iter()
        .position(|e| matches!(e, EngineEvent::StimulusOnset { trial_id: 0, .. }))
        .unwrap();
    let concluded = h
        .events
        .iter()
        .position(|e| matches!(e, EngineEvent::TrialConcluded { trial_id: 0, .. }))
        .unwrap();
    assert!(onset < concluded);
    let result = &h.engine.results()[0];
    assert_eq!(result.status, TrialStatus::NaturalEndNoResponseRequired);
    assert_eq!(result.concluded_at_ns, 1000 * 1_000_000);
}

#[test]
fn early_press_keeps_the_window_open_for_the_real_answer() {
    let config = ExperimentConfig {
        min_plausible_ms: 150,
        ..ExperimentConfig::default()
    };
    let mut h = Harness::with_config(&config, vec![motion(0)]);
    h.start();
    h.at(500);

    h.clock.advance_ms(120);
    h.press("left");
    assert!(h.engine.results().is_empty());
    assert_eq!(h.engine.current_phase(), TrialPhase::AwaitingResponse);

    h.clock.advance_ms(180);
    h.press("left");
    let result = &h.engine.results()[0];
    assert_eq!(result.status, TrialStatus::Responded);
    assert_eq!(result.response.as_deref(), Some("left"));
    assert_eq!(result.reaction_time_ms, Some(300.0));
    assert_eq!(result.correct, Some(true));
}

#[test]
fn pressing_during_a_catch_trial_is_an_error() {
    let mut h = Harness::new(vec![video(0, true)]);
    h.start();
    h.at(1000);
    h.clock.advance_ms(300);
    h.press("h");
    let result = &h.engine.results()[0];
    assert_eq!(result.status, TrialStatus::Responded);
    assert_eq!(result.correct, Some(false));
}

#[test]
fn stale_signals_do_not_touch_the_live_trial() {
    let mut h = Harness::new(vec![video(0, true), video(1, true)]);
    h.start();
    h.at(1000);
    let first = h.engine.renderer().last_ticket().generation;
    h.inject(first, Stage::Load, SignalKind::Ended);
    h.at(1000);
    assert_eq!(h.engine.results().len(), 1);

    // Trial 1 begins after the interval and loads its asset.
    h.at(2000);
    assert_eq!(h.engine.current_trial().map(|s| s.id), Some(1));
    let second = h.engine.renderer().last_ticket().generation;
    assert!(second > first);

    h.inject(first, Stage::Load, SignalKind::Ended);
    h.inject(first, Stage::Load, SignalKind::Error("late".into()));
    h.at(3000);
    h.inject(first, Stage::Load, SignalKind::Ended);
    h.at(3000);
    assert_eq!(h.engine.results().len(), 1);
    assert_eq!(h.engine.current_phase(), TrialPhase::AwaitingResponse);

    h.inject(second, Stage::Load, SignalKind::Ended);
    h.at(3000);
    assert_eq!(h.engine.results().len(), 2);
    assert_eq!(h.engine.results()[1].trial_id, 1);
}

#[test]
fn every_trial_gets_exactly_one_result() {
    let config = ExperimentConfig {
        total_trials: 20,
        rare_event_fraction: 0.15,
        min_spacing: 8,
        ..ExperimentConfig::for_protocol(ProtocolKind::Oddball)
    };
    let specs = ProtocolKind::Oddball
        .build_specs(&config, &mut StdRng::seed_from_u64(5))
        .unwrap();
    assert_eq!(specs.iter().filter(|s| s.condition == "target").count(), 3);

    let mut h = Harness::with_config(&config, specs);
    h.start();
    let mut ms = 0;
    while !h.engine.is_finished() && ms < 10_000 {
        ms += 125;
        h.at(ms);
    }
    assert!(h.engine.is_finished());

    let results = h.engine.results();
    assert_eq!(results.len(), 20);
    for (i, result) in results.iter().enumerate() {
        assert_eq!(result.trial_id, i);
        assert_eq!(result.status, TrialStatus::NaturalEndNoResponseRequired);
        assert_eq!(result.correct, Some(true));
    }
}

#[test]
fn finalize_is_idempotent() {
    let mut h = Harness::new(vec![motion(0), motion(1)]);
    h.start();
    h.at(500);
    h.clock.advance_ms(400);
    h.press("left");

    let first = h.engine.finalize().clone();
    assert_eq!(first.trials.len(), 1);
    assert!(h.engine.is_finished());

    let second = h.engine.finalize().clone();
    assert_eq!(first, second);
    assert_eq!(h.sends.get(), 1);
    assert!(h.engine.renderer().stops > 0);

    h.at(5000);
    assert_eq!(h.engine.results().len(), 1);
}

#[test]
fn structural_problems_fail_before_the_first_trial() {
    let build = |specs: Vec<TrialSpec>, config: &ExperimentConfig, surface_ok: bool| {
        let clock = ManualTimer::new();
        let mut renderer = ScriptedRenderer::new(clock.clone());
        renderer.surface_ok = surface_ok;
        Engine::new(
            config,
            specs,
            clock,
            renderer,
            StdRng::seed_from_u64(0),
            CountingClient::default(),
            EnvironmentDescriptor::default(),
        )
        .map(|_| ())
    };
    let config = ExperimentConfig::default();

    assert!(matches!(
        build(vec![], &config, true),
        Err(EngineError::EmptySession)
    ));
    assert!(matches!(
        build(vec![motion(1)], &config, true),
        Err(EngineError::TrialOrder { position: 0, found: 1 })
    ));

    let mut no_window = motion(0);
    no_window.timing.window_ms = 0;
    assert!(matches!(
        build(vec![no_window], &config, true),
        Err(EngineError::InvalidTrial { id: 0, .. })
    ));

    assert!(matches!(
        build(vec![motion(0)], &config, false),
        Err(EngineError::Render(RenderError::SurfaceMissing(_)))
    ));

    let missing_root = ExperimentConfig {
        asset_root: Some(PathBuf::from("/no/such/cogex/assets")),
        ..ExperimentConfig::default()
    };
    assert!(matches!(
        build(vec![motion(0)], &missing_root, true),
        Err(EngineError::MissingAssetRoot(_))
    ));

    assert!(build(vec![motion(0)], &config, true).is_ok());
}
