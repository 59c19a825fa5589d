use cogex_core::RenderError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("total trial count must be positive")]
    NoTrials,

    #[error("no conditions were given")]
    NoConditions,

    #[error("proportion for condition {condition} is invalid: {value}")]
    InvalidProportion { condition: String, value: f64 },

    #[error("condition proportions sum to {sum}, expected 1.0")]
    ProportionSum { sum: f64 },

    #[error("rare condition {0} has no proportion entry")]
    UnknownRareCondition(String),

    #[error("rare event fraction {0} is outside [0, 1]")]
    RareFraction(f64),

    #[error("onset delay range is inverted: {min}ms > {max}ms")]
    OnsetRange { min: u64, max: u64 },

    #[error("response window must be positive for trials expecting a response")]
    ZeroWindow,

    #[error("max load attempts must be at least 1")]
    ZeroAttempts,

    #[error("protocol {protocol} needs {what}")]
    Missing {
        protocol: &'static str,
        what: &'static str,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Structural failures detected before the first trial. These are the only
/// errors that stop a session.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("no trials to run")]
    EmptySession,

    #[error("trial ids must run 0..n in order; found {found} at position {position}")]
    TrialOrder { position: usize, found: usize },

    #[error("trial {id}: {reason}")]
    InvalidTrial { id: usize, reason: String },

    #[error("asset root {0} does not exist")]
    MissingAssetRoot(PathBuf),
}

#[derive(Error, Debug)]
pub enum TransmitError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
