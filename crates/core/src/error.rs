//! Error types for the tickalign system.
//!
//! Malformed ticks and unmatched snapshots are deliberately *not* errors:
//! the former are counted rejects, the latter are tagged rows.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the tickalign system.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Concurrent writer detected on the same instrument. Retryable; only
    /// that instrument's refresh aborts.
    #[error("Watermark conflict: concurrent refresh detected for instrument {instrument_id}")]
    WatermarkConflict { instrument_id: String },

    /// A source read failed or timed out. Retryable; committed instruments
    /// keep their watermark.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// A correctness defect: a disallowed field would be emitted or a
    /// watermark would regress. Fatal, aborts the run.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Durable store error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a watermark conflict error.
    pub fn watermark_conflict(instrument_id: impl Into<String>) -> Self {
        Error::WatermarkConflict {
            instrument_id: instrument_id.into(),
        }
    }

    /// Create an upstream-unavailable error.
    pub fn upstream(msg: impl Into<String>) -> Self {
        Error::UpstreamUnavailable(msg.into())
    }

    /// Create an invariant violation error.
    pub fn invariant(msg: impl Into<String>) -> Self {
        Error::InvariantViolation(msg.into())
    }

    /// Create a storage error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }

    /// Whether retrying the same unit of work can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::WatermarkConflict { .. } | Error::UpstreamUnavailable(_)
        )
    }

    /// Whether this error signals a defect that must abort the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::InvariantViolation(_))
    }
}
