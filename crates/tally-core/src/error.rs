//! Error types for the tally metrics engine.

use thiserror::Error;

use crate::types::MetricKind;

/// Result type alias for metrics operations.
pub type MetricsResult<T> = Result<T, MetricsError>;

/// Errors raised by the registry, the metric handles, and storage backends.
///
/// `TypeMismatch`, `LabelArityMismatch`, `InvalidDelta` and `InvalidBuckets`
/// indicate a misused metric name and are always returned to the caller.
/// `BackendUnavailable` is recovered by the registry.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metric {name} is registered as a {existing}, not a {requested}")]
    TypeMismatch {
        name: String,
        existing: MetricKind,
        requested: MetricKind,
    },

    #[error(
        "metric {name} is registered with labels [{}], got [{}]",
        .expected.join(", "),
        .actual.join(", ")
    )]
    LabelArityMismatch {
        name: String,
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error("counter {name} cannot be incremented by {delta}")]
    InvalidDelta { name: String, delta: f64 },

    #[error("histogram {name} has invalid buckets: {reason}")]
    InvalidBuckets { name: String, reason: String },

    #[error("storage backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("serialization failure: {0}")]
    Serialization(String),
}

impl MetricsError {
    /// Whether the error came from the storage layer rather than the caller.
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, MetricsError::BackendUnavailable(_))
    }
}
