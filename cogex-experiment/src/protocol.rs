//! Built-in paradigms. Each turns an [`ExperimentConfig`] into the ordered
//! trial list the engine runs.

use crate::config::ExperimentConfig;
use crate::error::ConfigError;
use crate::order::{ConditionShare, TrialOrderGenerator, balanced};
use cogex_core::stimulus::{BLACK, BLUE, GREEN, MARKER_DARK, MARKER_LIGHT, ORANGE, RED, YELLOW};
use cogex_core::{CueShape, Direction, StimulusDescriptor, StimulusKind, TrialSpec, TrialTiming};
use rand::Rng;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProtocolKind {
    /// Adapt to a drifting grating, then judge the direction of a dot field.
    #[default]
    MotionAdaptation,
    /// Rapid letter stream with a rare target and a photodiode marker.
    Oddball,
    /// Watch a grip video, respond to the coloured cue laid over it.
    VideoCue,
    /// Press the key that lights up, with or without an arrow announcing it.
    CuedReaction,
}

impl ProtocolKind {
    pub const ALL: [ProtocolKind; 4] = [
        ProtocolKind::MotionAdaptation,
        ProtocolKind::Oddball,
        ProtocolKind::VideoCue,
        ProtocolKind::CuedReaction,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ProtocolKind::MotionAdaptation => "motion_adaptation",
            ProtocolKind::Oddball => "letters_p300",
            ProtocolKind::VideoCue => "squeeze_video_cue",
            ProtocolKind::CuedReaction => "attention_rt",
        }
    }

    pub fn expects_responses(self) -> bool {
        !matches!(self, ProtocolKind::Oddball)
    }

    /// Practice trials first, then the main block; ids run `0..n`.
    pub fn build_specs<R: Rng + ?Sized>(
        self,
        config: &ExperimentConfig,
        rng: &mut R,
    ) -> Result<Vec<TrialSpec>, ConfigError> {
        config.validate()?;
        let main = match self {
            ProtocolKind::MotionAdaptation => motion_adaptation(config, rng)?,
            ProtocolKind::Oddball => oddball(config, rng)?,
            ProtocolKind::VideoCue => video_cue(config, rng)?,
            ProtocolKind::CuedReaction => cued_reaction(config, rng)?,
        };
        let specs = with_practice(main, config.practice_trials);
        info!(
            protocol = self.name(),
            trials = specs.len(),
            practice = specs.iter().filter(|s| s.is_practice).count(),
            "trial list built"
        );
        Ok(specs)
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProtocolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.replace(['-', '_'], "").to_ascii_lowercase();
        ProtocolKind::ALL
            .into_iter()
            .find(|p| {
                let camel = format!("{p:?}").to_ascii_lowercase();
                camel == wanted || p.name().replace('_', "") == wanted
            })
            .ok_or_else(|| format!("unknown protocol '{s}'"))
    }
}

/// Copies the last `n` main trials to the front as practice, then renumbers
/// every trial so ids follow presentation order.
pub fn with_practice(main: Vec<TrialSpec>, n: usize) -> Vec<TrialSpec> {
    let n = n.min(main.len());
    let mut specs: Vec<TrialSpec> = main[main.len() - n..]
        .iter()
        .cloned()
        .map(|mut spec| {
            spec.is_practice = true;
            spec
        })
        .collect();
    specs.extend(main);
    for (id, spec) in specs.iter_mut().enumerate() {
        spec.id = id;
    }
    specs
}

fn response_symbols(
    config: &ExperimentConfig,
    protocol: &'static str,
) -> Result<BTreeSet<String>, ConfigError> {
    let symbols: BTreeSet<String> = config.response_keys.values().cloned().collect();
    if symbols.is_empty() {
        return Err(ConfigError::Missing {
            protocol,
            what: "response keys",
        });
    }
    Ok(symbols)
}

const CONGRUENT: &str = "congruent";
const INCONGRUENT: &str = "incongruent";
const MOTION_COHERENCE: f32 = 1.0;

fn motion_adaptation<R: Rng + ?Sized>(
    config: &ExperimentConfig,
    rng: &mut R,
) -> Result<Vec<TrialSpec>, ConfigError> {
    let valid = response_symbols(config, "motionAdaptation")?;
    let order = TrialOrderGenerator::new(
        config.total_trials,
        vec![
            ConditionShare::new(CONGRUENT, 0.5),
            ConditionShare::new(INCONGRUENT, 0.5),
        ],
    )?
    .no_adjacent_repeat(config.no_adjacent_repeat)
    .generate(rng);

    let sides = [Direction::Left, Direction::Right];
    let n_congruent = order.labels.iter().filter(|l| *l == CONGRUENT).count();
    let mut congruent = balanced(&sides, n_congruent, rng).into_iter();
    let mut incongruent = balanced(&sides, order.labels.len() - n_congruent, rng).into_iter();
    let timing = config.timing();

    Ok(order
        .labels
        .into_iter()
        .enumerate()
        .map(|(id, label)| {
            let is_congruent = label == CONGRUENT;
            let pool = if is_congruent {
                &mut congruent
            } else {
                &mut incongruent
            };
            let adapt = pool.next().unwrap_or(Direction::Left);
            let test = if is_congruent { adapt } else { adapt.opposite() };
            TrialSpec {
                id,
                condition: label,
                stimulus: StimulusDescriptor::new(StimulusKind::DotMotion {
                    direction: test,
                    coherence: MOTION_COHERENCE,
                })
                .with_adapt(StimulusKind::Grating { direction: adapt }),
                valid_responses: valid.clone(),
                expected: Some(test.symbol().to_string()),
                timing: timing.clone(),
                is_practice: false,
            }
        })
        .collect())
}

const ODDBALL_TARGET: &str = "X";
const ODDBALL_LETTERS: &str = "abcdefghijklmnopqrstuvwyzABCDEFGHIJKLMNOPQRSTUVWYZ";

fn oddball<R: Rng + ?Sized>(
    config: &ExperimentConfig,
    rng: &mut R,
) -> Result<Vec<TrialSpec>, ConfigError> {
    let fraction = config.rare_event_fraction;
    let letters: Vec<String> = ODDBALL_LETTERS.chars().map(String::from).collect();
    let common_share = (1.0 - fraction) / letters.len() as f64;

    let mut shares = vec![ConditionShare::new(ODDBALL_TARGET, fraction)];
    shares.extend(letters.iter().map(|l| ConditionShare::new(l.clone(), common_share)));

    let order = TrialOrderGenerator::new(config.total_trials, shares)?
        .with_rare(ODDBALL_TARGET, config.min_spacing)?
        .no_adjacent_repeat(config.no_adjacent_repeat)
        .generate(rng);

    let timing = config.timing();
    let mut targets_seen = 0usize;
    Ok(order
        .labels
        .into_iter()
        .enumerate()
        .map(|(id, letter)| {
            let is_target = letter == ODDBALL_TARGET;
            if is_target {
                targets_seen += 1;
            }
            // The photodiode square flips shade on every target.
            let marker = if targets_seen % 2 == 0 {
                MARKER_DARK
            } else {
                MARKER_LIGHT
            };
            TrialSpec {
                id,
                condition: if is_target { "target" } else { "standard" }.to_string(),
                stimulus: StimulusDescriptor::new(StimulusKind::Letter {
                    content: letter,
                    color: if is_target { RED } else { BLACK },
                })
                .with_marker(marker),
                valid_responses: BTreeSet::new(),
                expected: None,
                timing: timing.clone(),
                is_practice: false,
            }
        })
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VideoSource {
    Hard,
    Soft,
    Baseline,
    Either,
}

struct CueCondition {
    label: &'static str,
    weight: u32,
    video: VideoSource,
    cue: [u8; 4],
    expected: Option<&'static str>,
}

const VIDEO_CUE_CONDITIONS: [CueCondition; 7] = [
    CueCondition {
        label: "congruent_hard",
        weight: 10,
        video: VideoSource::Hard,
        cue: ORANGE,
        expected: Some("hard"),
    },
    CueCondition {
        label: "congruent_soft",
        weight: 10,
        video: VideoSource::Soft,
        cue: GREEN,
        expected: Some("soft"),
    },
    CueCondition {
        label: "incongruent_hard",
        weight: 10,
        video: VideoSource::Soft,
        cue: ORANGE,
        expected: Some("hard"),
    },
    CueCondition {
        label: "incongruent_soft",
        weight: 10,
        video: VideoSource::Hard,
        cue: GREEN,
        expected: Some("soft"),
    },
    CueCondition {
        label: "baseline_hard",
        weight: 20,
        video: VideoSource::Baseline,
        cue: ORANGE,
        expected: Some("hard"),
    },
    CueCondition {
        label: "baseline_soft",
        weight: 20,
        video: VideoSource::Baseline,
        cue: GREEN,
        expected: Some("soft"),
    },
    CueCondition {
        label: "neutral_catch",
        weight: 40,
        video: VideoSource::Either,
        cue: BLUE,
        expected: None,
    },
];

fn video_cue<R: Rng + ?Sized>(
    config: &ExperimentConfig,
    rng: &mut R,
) -> Result<Vec<TrialSpec>, ConfigError> {
    let valid = response_symbols(config, "videoCue")?;
    let media = |kind: &str| config.media_assets.get(kind).filter(|list| !list.is_empty());
    let (Some(hard), Some(soft)) = (media("hard"), media("soft")) else {
        return Err(ConfigError::Missing {
            protocol: "videoCue",
            what: "hard and soft media assets",
        });
    };

    let total_weight: u32 = VIDEO_CUE_CONDITIONS.iter().map(|c| c.weight).sum();
    let shares = VIDEO_CUE_CONDITIONS
        .iter()
        .map(|c| ConditionShare::new(c.label, f64::from(c.weight) / f64::from(total_weight)))
        .collect();
    let order = TrialOrderGenerator::new(config.total_trials, shares)?
        .no_adjacent_repeat(config.no_adjacent_repeat)
        .generate(rng);

    let base_timing = config.timing();
    let mut specs = Vec::with_capacity(order.labels.len());
    for (id, label) in order.labels.into_iter().enumerate() {
        let Some(condition) = VIDEO_CUE_CONDITIONS.iter().find(|c| c.label == label) else {
            continue;
        };
        let list = match condition.video {
            VideoSource::Hard => Some(hard),
            VideoSource::Soft => Some(soft),
            VideoSource::Baseline => None,
            VideoSource::Either => Some(if rng.random_bool(0.5) { hard } else { soft }),
        };
        let shape = if condition.expected.is_some() {
            CueShape::Dot
        } else {
            CueShape::Polygon
        };

        let mut stimulus = StimulusDescriptor::new(StimulusKind::Cue {
            shape,
            color: condition.cue,
        });
        if let Some(video) = list.and_then(|l| l.choose(rng)) {
            stimulus = stimulus.with_asset(video.clone());
            if config.media_duration_ms > 0 {
                stimulus = stimulus.with_clip_length(config.media_duration_ms);
            }
        }

        // Catch trials run until the video ends on its own.
        let timing = match condition.expected {
            Some(_) => base_timing.clone(),
            None => TrialTiming {
                window_ms: 0,
                ..base_timing.clone()
            },
        };

        specs.push(TrialSpec {
            id,
            condition: label,
            stimulus,
            valid_responses: if condition.expected.is_some() {
                valid.clone()
            } else {
                BTreeSet::new()
            },
            expected: condition.expected.map(str::to_string),
            timing,
            is_practice: false,
        });
    }
    Ok(specs)
}

const UNCUED: &str = "uncued";
const CUED: &str = "cued";

/// First half uncued, second half cued. Only the lit key counts as a
/// response.
fn cued_reaction<R: Rng + ?Sized>(
    config: &ExperimentConfig,
    rng: &mut R,
) -> Result<Vec<TrialSpec>, ConfigError> {
    let symbols: Vec<String> = response_symbols(config, "cuedReaction")?
        .into_iter()
        .collect();
    let total = config.total_trials;
    let uncued = total.div_ceil(2);
    let targets = balanced(&symbols, total, rng);
    let base_timing = config.timing();

    Ok(targets
        .into_iter()
        .enumerate()
        .map(|(id, key)| {
            let is_cued = id >= uncued;
            let mut stimulus = StimulusDescriptor::new(StimulusKind::KeyHighlight {
                key: key.clone(),
                color: GREEN,
            });
            let timing = if is_cued {
                stimulus = stimulus.with_adapt(StimulusKind::KeyHighlight {
                    key: key.clone(),
                    color: YELLOW,
                });
                TrialTiming {
                    onset_delay_ms: (0, 0),
                    ..base_timing.clone()
                }
            } else {
                TrialTiming {
                    adapt_ms: 0,
                    ..base_timing.clone()
                }
            };
            TrialSpec {
                id,
                condition: if is_cued { CUED } else { UNCUED }.to_string(),
                stimulus,
                valid_responses: BTreeSet::from([key.clone()]),
                expected: Some(key),
                timing,
                is_practice: false,
            }
        })
        .collect())
}
