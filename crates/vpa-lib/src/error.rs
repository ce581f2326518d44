//! Domain error types
//!
//! Identity errors carry the missing key so callers can log and skip.
//! Transport failures at the trait seams use `anyhow` instead.

use crate::models::{ContainerId, PodId, VpaId};
use thiserror::Error;

/// Errors raised by the cluster state model
#[derive(Debug, Error, PartialEq)]
pub enum ClusterStateError {
    #[error("pod {0} not present in cluster state")]
    PodNotFound(PodId),

    #[error("container {0} not present in cluster state")]
    ContainerNotFound(ContainerId),

    #[error("vpa {0} not present in cluster state")]
    VpaNotFound(VpaId),

    #[error("failed to merge aggregates: {0}")]
    Aggregation(#[from] HistogramError),
}

/// Errors raised by histograms and their checkpoints
#[derive(Debug, Error, PartialEq)]
pub enum HistogramError {
    #[error("invalid histogram options: {0}")]
    InvalidOptions(String),

    #[error("cannot merge histograms with different bucket options")]
    OptionsMismatch,

    #[error("cannot merge decaying histograms with different half-lives ({left}s vs {right}s)")]
    HalfLifeMismatch { left: i64, right: i64 },

    #[error("checkpoint bucket {bucket} out of range (histogram has {num_buckets} buckets)")]
    BucketOutOfRange { bucket: usize, num_buckets: usize },

    #[error("checkpoint has invalid total weight {0}")]
    InvalidTotalWeight(f64),
}

/// Errors raised while restoring aggregate state from a checkpoint
#[derive(Debug, Error, PartialEq)]
pub enum CheckpointError {
    #[error("unsupported checkpoint version {found:?}, expected {expected:?}")]
    UnsupportedVersion { found: String, expected: String },

    #[error("failed to load {resource} histogram: {source}")]
    Histogram {
        resource: &'static str,
        #[source]
        source: HistogramError,
    },

    #[error("checkpoint refers to unknown vpa {0}")]
    VpaNotFound(VpaId),
}

/// Errors raised by the eviction restriction
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EvictionError {
    #[error("pod {0} is not part of a replicated group that can be evicted")]
    NotReplicated(PodId),

    #[error("eviction budget exceeded for pod {0}")]
    BudgetExceeded(PodId),

    #[error("no replica group stats for {0}")]
    MissingGroupStats(String),

    #[error("eviction of pod {pod} failed: {message}")]
    ApiFailure { pod: PodId, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_error_carries_key() {
        let err = ClusterStateError::PodNotFound(PodId::new("ns", "web-1"));
        assert_eq!(err.to_string(), "pod ns/web-1 not present in cluster state");
    }

    #[test]
    fn test_checkpoint_error_wraps_histogram_error() {
        let err = CheckpointError::Histogram {
            resource: "cpu",
            source: HistogramError::InvalidTotalWeight(-1.0),
        };
        assert!(err.to_string().contains("cpu histogram"));
    }
}
