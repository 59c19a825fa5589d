use crate::error::ConfigError;
use crate::loader::RetryPolicy;
use crate::protocol::ProtocolKind;
use cogex_core::{AdaptCompletion, TrialTiming};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_COHORT: &str = "N/A";

/// Everything a session needs besides the trial list itself. Loaded from a
/// JSON file; any field left out falls back to the protocol's defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExperimentConfig {
    pub experiment_name: String,
    pub protocol: ProtocolKind,
    pub total_trials: usize,
    pub practice_trials: usize,
    pub rare_event_fraction: f64,
    pub min_spacing: usize,
    pub no_adjacent_repeat: bool,
    pub onset_delay_range_ms: (u64, u64),
    pub adapt_duration_ms: u64,
    pub adapt_completion: AdaptCompletion,
    pub stimulus_duration_ms: u64,
    /// Length of each media clip. Zero leaves the end to the renderer.
    pub media_duration_ms: u64,
    pub window_length_ms: u64,
    pub min_plausible_ms: u64,
    pub max_load_attempts: u32,
    pub retry_delay_ms: u64,
    pub inter_trial_interval_ms: u64,
    pub asset_root: Option<PathBuf>,
    /// Asset locators grouped by kind, e.g. `"hard" -> ["./img/hard1.mp4"]`.
    pub media_assets: BTreeMap<String, Vec<String>>,
    /// Physical key name -> response symbol.
    pub response_keys: BTreeMap<String, String>,
    pub cohort: Option<String>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self::for_protocol(ProtocolKind::MotionAdaptation)
    }
}

fn keys(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl ExperimentConfig {
    pub fn for_protocol(protocol: ProtocolKind) -> Self {
        let base = Self {
            experiment_name: protocol.name().to_string(),
            protocol,
            total_trials: 60,
            practice_trials: 0,
            rare_event_fraction: 0.0,
            min_spacing: 0,
            no_adjacent_repeat: false,
            onset_delay_range_ms: (1000, 3000),
            adapt_duration_ms: 0,
            adapt_completion: AdaptCompletion::Timer,
            stimulus_duration_ms: 200,
            media_duration_ms: 0,
            window_length_ms: 2000,
            min_plausible_ms: 200,
            max_load_attempts: 3,
            retry_delay_ms: 500,
            inter_trial_interval_ms: 1000,
            asset_root: None,
            media_assets: BTreeMap::new(),
            response_keys: BTreeMap::new(),
            cohort: None,
        };

        match protocol {
            ProtocolKind::MotionAdaptation => Self {
                practice_trials: 3,
                onset_delay_range_ms: (0, 0),
                adapt_duration_ms: 2000,
                stimulus_duration_ms: 2000,
                response_keys: keys(&[("ArrowLeft", "left"), ("ArrowRight", "right")]),
                ..base
            },
            ProtocolKind::Oddball => Self {
                total_trials: 1000,
                rare_event_fraction: 0.05,
                // Eight common letters on either side of every X.
                min_spacing: 9,
                no_adjacent_repeat: true,
                onset_delay_range_ms: (0, 0),
                stimulus_duration_ms: 125,
                window_length_ms: 125,
                min_plausible_ms: 0,
                inter_trial_interval_ms: 0,
                ..base
            },
            ProtocolKind::VideoCue => {
                let mut media = BTreeMap::new();
                media.insert(
                    "hard".to_string(),
                    (1..=4).map(|i| format!("./img/hard{i}.mp4")).collect(),
                );
                let mut soft: Vec<String> = (1..=4).map(|i| format!("./img/soft{i}.mp4")).collect();
                soft.push("./img/Soft5.mp4".to_string());
                media.insert("soft".to_string(), soft);
                Self {
                    total_trials: 120,
                    practice_trials: 10,
                    // The cue is up for a second; the clip runs past the
                    // latest cue onset plus the response window.
                    stimulus_duration_ms: 1000,
                    media_duration_ms: 6000,
                    min_plausible_ms: 150,
                    inter_trial_interval_ms: 1500,
                    media_assets: media,
                    response_keys: keys(&[("h", "hard"), ("s", "soft")]),
                    ..base
                }
            }
            ProtocolKind::CuedReaction => Self {
                total_trials: 40,
                onset_delay_range_ms: (2000, 2000),
                adapt_duration_ms: 3000,
                stimulus_duration_ms: 0,
                window_length_ms: 5000,
                min_plausible_ms: 150,
                response_keys: keys(&[
                    ("a", "a"),
                    ("s", "s"),
                    ("d", "d"),
                    ("f", "f"),
                    ("j", "j"),
                    ("k", "k"),
                    ("l", "l"),
                    (";", ";"),
                ]),
                ..base
            },
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Fields present in `text` override the defaults of the protocol it
    /// names (or of the default protocol when it names none).
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let overrides: serde_json::Value = serde_json::from_str(text)?;
        let protocol = match overrides.get("protocol") {
            Some(value) => serde_json::from_value(value.clone())?,
            None => ProtocolKind::default(),
        };
        let mut merged = serde_json::to_value(Self::for_protocol(protocol))?;
        if let (Some(base), Some(fields)) = (merged.as_object_mut(), overrides.as_object()) {
            for (key, value) in fields {
                base.insert(key.clone(), value.clone());
            }
        }
        Ok(serde_json::from_value(merged)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.total_trials == 0 {
            return Err(ConfigError::NoTrials);
        }
        if !(0.0..=1.0).contains(&self.rare_event_fraction) {
            return Err(ConfigError::RareFraction(self.rare_event_fraction));
        }
        let (min, max) = self.onset_delay_range_ms;
        if min > max {
            return Err(ConfigError::OnsetRange { min, max });
        }
        if self.max_load_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        if self.protocol.expects_responses() && self.window_length_ms == 0 {
            return Err(ConfigError::ZeroWindow);
        }
        Ok(())
    }

    pub fn timing(&self) -> TrialTiming {
        TrialTiming {
            onset_delay_ms: self.onset_delay_range_ms,
            adapt_ms: self.adapt_duration_ms,
            adapt_completion: self.adapt_completion,
            stimulus_ms: self.stimulus_duration_ms,
            window_ms: self.window_length_ms,
            inter_trial_ms: self.inter_trial_interval_ms,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_load_attempts,
            retry_delay_ms: self.retry_delay_ms,
        }
    }

    pub fn cohort_tag(&self) -> &str {
        self.cohort.as_deref().unwrap_or(DEFAULT_COHORT)
    }

    /// Response symbol bound to a physical key, if any.
    pub fn symbol_for_key(&self, key: &str) -> Option<&str> {
        self.response_keys.get(key).map(String::as_str)
    }
}
