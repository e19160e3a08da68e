use thiserror::Error;

use crate::types::{RegionId, StepIndex};

/// Where in a step a model failure surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    Advance,
    Link,
    Commit,
    Capture,
}

impl std::fmt::Display for StepPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Advance => "advance",
            Self::Link    => "link",
            Self::Commit  => "commit",
            Self::Capture => "capture",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum SimError {
    #[error("Unknown region '{region}'")]
    InvalidRegion { region: RegionId },

    #[error("Step loop already running")]
    AlreadyRunning,

    #[error("Model for region '{region}' failed during {phase} of step {step}: {source}")]
    ModelStepFailure {
        region: RegionId,
        phase:  StepPhase,
        step:   StepIndex,
        #[source]
        source: anyhow::Error,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Model for region '{region}' does not support state snapshots")]
    SnapshotUnsupported { region: RegionId },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SimError {
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig { reason: reason.into() }
    }
}

pub type SimResult<T> = Result<T, SimError>;
