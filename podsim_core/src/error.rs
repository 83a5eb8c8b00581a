//! Error types for the podsim_core library.

use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Integration stage that produced a numeric failure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimulationStage {
    Absorption,
    Action,
}

impl std::fmt::Display for SimulationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SimulationStage::Absorption => write!(f, "absorption"),
            SimulationStage::Action => write!(f, "action"),
        }
    }
}

/// Core error type for podsim_core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Telemetry record could not be interpreted
    #[error("Telemetry error: {0}")]
    Telemetry(String),

    /// A compartment amount went negative during integration.
    ///
    /// Fatal: the parameters or the step size are unusable for this input.
    #[error("Numeric instability in {stage} simulation at minute {minute}")]
    NumericInstability { stage: SimulationStage, minute: usize },

    /// Depot pools did not drain within the configured tail cap
    #[error("Absorption depot did not drain within {minutes} minutes")]
    DrainTimeout { minutes: usize },

    /// Degenerate smoothing filter configuration
    #[error("Trend filter error: {0}")]
    Trend(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}
