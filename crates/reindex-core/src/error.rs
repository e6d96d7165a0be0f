use crate::identity::TargetKind;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReindexError>;

#[derive(Error, Debug)]
pub enum ReindexError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    ConfigError(#[from] toml::de::Error),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("{kind} '{key}' not found")]
    TargetNotFound { kind: TargetKind, key: String },

    #[error("{kind} '{key}' does not support reindexing: {detail}")]
    NotEligible {
        kind: TargetKind,
        key: String,
        detail: String,
    },

    #[error("Unrecognised orchestration id: {0}")]
    UnknownIdentity(String),

    #[error("Orchestration {id} was modified concurrently")]
    VersionConflict { id: String },

    #[error("{0}")]
    Other(String),
}

impl ReindexError {
    /// Precondition failures are the only errors surfaced to a Start caller.
    #[must_use]
    pub const fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::InvalidTarget(_) | Self::TargetNotFound { .. } | Self::NotEligible { .. }
        )
    }
}
