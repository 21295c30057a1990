//! Error definitions.
//!
//! Failures (counter exhaustion, allocation failure, bad configuration, malformed traces) are
//! reported through [`RdaError`]. A lookup that finds the block map and the stack tree out of
//! step is reported as [`RdaError::Internal`]; a barrier stage mismatch still panics.

use std::collections::TryReserveError;

use thiserror::Error;

/// Errors returned by the engine.
#[derive(Debug, Error)]
pub enum RdaError {
    /// A logical-time or sample counter reached [`MAX_ACCESS_COUNT`](super::MAX_ACCESS_COUNT).
    #[error("access counter overflow after {0} references")]
    CounterOverflow(u64),

    /// A histogram bucket counter reached its limit.
    #[error("distance histogram bucket {bucket} overflowed")]
    BucketOverflow {
        /// Index of the saturated bucket.
        bucket: usize,
    },

    /// Growing an internal table failed.
    #[error("allocation failed while growing the {what}")]
    Allocation {
        /// Name of the table being grown.
        what: &'static str,
        /// Underlying reservation failure.
        #[source]
        source: TryReserveError,
    },

    /// A target hit rate outside `[0, 1)`.
    #[error("target hit rate must be in [0, 1), got {0}")]
    InvalidHitRate(f64),

    /// Unknown stack implementation name.
    #[error("stack kind must be \"exact\" or \"approximate\", got {0:?}")]
    UnknownStackKind(String),

    /// Any other rejected configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// More threads than the barrier supports.
    #[error("at most {max} threads are supported")]
    TooManyThreads {
        /// Configured thread limit.
        max: usize,
    },

    /// Threads must be registered with consecutive ids starting at 0.
    #[error("threads must be registered in id order: expected {expected}, got {got}")]
    ThreadOrder {
        /// Next id the engine expects.
        expected: usize,
        /// Id that was requested.
        got: usize,
    },

    /// Malformed trace line.
    #[error("trace line {line}: {message}")]
    Trace {
        /// 1-based line number.
        line: usize,
        /// Description of the problem.
        message: String,
    },

    /// An access larger than `general.max_access_size`.
    #[error("access of {size} bytes exceeds the {max}-byte limit")]
    AccessTooLarge {
        /// Requested size in bytes.
        size: u64,
        /// Configured limit in bytes.
        max: u64,
    },

    /// Internal tables disagree, e.g. a tracked reference with no stack node.
    #[error("internal stack inconsistency: {0}")]
    Internal(String),

    /// I/O failure while reading or writing traces and dumps.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl RdaError {
    /// Wraps a reservation failure for the named table.
    pub(crate) const fn allocation(what: &'static str, source: TryReserveError) -> Self {
        Self::Allocation { what, source }
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = RdaError> = std::result::Result<T, E>;
