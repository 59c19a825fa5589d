use crate::stimulus::StimulusDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// How the adaptation stage ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AdaptCompletion {
    #[default]
    Timer,
    RendererEnded,
}

/// Per-trial timing, all in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialTiming {
    pub onset_delay_ms: (u64, u64),
    pub adapt_ms: u64,
    pub adapt_completion: AdaptCompletion,
    pub stimulus_ms: u64,
    pub window_ms: u64,
    pub inter_trial_ms: u64,
}

impl Default for TrialTiming {
    fn default() -> Self {
        Self {
            onset_delay_ms: (0, 0),
            adapt_ms: 0,
            adapt_completion: AdaptCompletion::Timer,
            stimulus_ms: 200,
            window_ms: 2000,
            inter_trial_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialSpec {
    pub id: usize,
    pub condition: String,
    pub stimulus: StimulusDescriptor,
    /// Empty means no response is expected (catch / no-go trial).
    pub valid_responses: BTreeSet<String>,
    pub expected: Option<String>,
    pub timing: TrialTiming,
    pub is_practice: bool,
}

impl TrialSpec {
    pub fn expects_response(&self) -> bool {
        !self.valid_responses.is_empty()
    }

    pub fn needs_asset(&self) -> bool {
        self.stimulus.asset.is_some()
    }

    pub fn has_adapt_stage(&self) -> bool {
        self.stimulus.adapt.is_some()
            && (self.timing.adapt_ms > 0
                || self.timing.adapt_completion == AdaptCompletion::RendererEnded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrialStatus {
    Responded,
    TimedOut,
    SkippedLoadFailure,
    NaturalEndNoResponseRequired,
}

/// Stimulus parameters as actually shown, after random sub-choices resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresentedValues {
    pub stimulus: StimulusDescriptor,
    pub onset_delay_ms: u64,
}

/// Recorded outcome of one trial. Built once when the trial concludes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialResult {
    pub trial_id: usize,
    pub condition: String,
    pub is_practice: bool,
    pub presented_values: PresentedValues,
    pub response: Option<String>,
    pub reaction_time_ms: Option<f64>,
    pub correct: Option<bool>,
    pub status: TrialStatus,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub concluded_at_ns: u64,
}
