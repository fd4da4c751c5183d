//! Error types for Dayline.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Spawn error ({service}): {reason}")]
    Spawn { service: String, reason: String },

    #[error("Handshake error ({service}): {reason}")]
    Handshake { service: String, reason: String },

    #[error("Timeout: {service}::{operation} exceeded {timeout_ms}ms")]
    Timeout {
        service: String,
        operation: String,
        timeout_ms: u64,
    },

    #[error("Invocation error ({service}): {reason}")]
    Invocation { service: String, reason: String },

    #[error("Planning error: {0}")]
    Planning(String),

    #[error("Decision error: {0}")]
    Decision(String),

    #[error("Decision limit reached after {0} decisions with capabilities still pending")]
    DecisionLimit(usize),

    #[error("Synthesis error: {0}")]
    Synthesis(String),

    #[error("Completion error: {0}")]
    Completion(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error only affects a single capability and leaves the run usable.
    pub fn is_capability_failure(&self) -> bool {
        matches!(
            self,
            Self::Spawn { .. } | Self::Handshake { .. } | Self::Timeout { .. } | Self::Invocation { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
