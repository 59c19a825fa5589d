use crate::config::ExperimentConfig;
use chrono::{DateTime, Utc};
use cogex_core::TrialResult;
use cogex_timing::CalibrationStats;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayInfo {
    pub width: u32,
    pub height: u32,
    pub scale_factor: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_rate_hz: Option<f64>,
}

/// Where the session ran. Filled in by the host before the engine starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentDescriptor {
    pub os: String,
    pub arch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub headless: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<DisplayInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_timing: Option<CalibrationStats>,
}

impl EnvironmentDescriptor {
    pub fn detect() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            host: std::env::var("HOSTNAME")
                .or_else(|_| std::env::var("COMPUTERNAME"))
                .ok(),
            headless: false,
            display: None,
            display_timing: None,
        }
    }

    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn with_display(mut self, display: DisplayInfo) -> Self {
        self.display = Some(display);
        self
    }

    pub fn with_timing(mut self, stats: CalibrationStats) -> Self {
        self.display_timing = Some(stats);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialCounts {
    pub main: usize,
    pub practice: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub session_id: Uuid,
    pub experiment_name: String,
    pub experiment_version: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub environment: EnvironmentDescriptor,
    pub config: ExperimentConfig,
    pub trial_counts: TrialCounts,
    pub cohort: String,
}

impl SessionMeta {
    pub fn new(
        config: &ExperimentConfig,
        environment: EnvironmentDescriptor,
        trial_counts: TrialCounts,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            experiment_name: config.experiment_name.clone(),
            experiment_version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: Utc::now(),
            ended_at: None,
            environment,
            config: config.clone(),
            trial_counts,
            cohort: config.cohort_tag().to_string(),
        }
    }
}

/// The document handed to the transmission client: `{session, trials}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionPayload {
    pub session: SessionMeta,
    pub trials: Vec<TrialResult>,
}
