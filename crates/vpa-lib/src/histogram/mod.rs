//! Weighted histograms for usage telemetry
//!
//! This module provides:
//! - Bucket layouts (linear and exponential)
//! - A plain weighted histogram with percentile queries
//! - A time-decaying wrapper that favours recent samples
//! - A lossy, bounded checkpoint encoding

mod decaying;
mod options;
mod weighted;

pub use decaying::{DecayingHistogram, MAX_DECAY_EXPONENT};
pub use options::HistogramOptions;
pub use weighted::Histogram;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Integer weight assigned to the heaviest bucket in a checkpoint
pub const MAX_CHECKPOINT_WEIGHT: u32 = 10_000;

/// Serialized form of a histogram
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramCheckpoint {
    /// Reference timestamp of a decaying histogram
    #[serde(default)]
    pub reference_timestamp: Option<DateTime<Utc>>,
    /// Bucket index to integer weight in `1..=MAX_CHECKPOINT_WEIGHT`
    #[serde(default)]
    pub bucket_weights: BTreeMap<usize, u32>,
    pub total_weight: f64,
}

/// Bucket layout for CPU histograms, in cores
///
/// Covers up to 1000 cores; the first bucket is 10 millicores wide and each
/// following bucket is 5% wider than the previous one.
pub fn cpu_histogram_options() -> HistogramOptions {
    HistogramOptions::exponential(1000.0, 0.01, 1.05, 1e-4)
        .expect("default CPU histogram options are valid")
}

/// Bucket layout for memory histograms, in bytes
///
/// Covers up to 1TB; the first bucket is 10MB wide and each following
/// bucket is 5% wider than the previous one.
pub fn memory_histogram_options() -> HistogramOptions {
    HistogramOptions::exponential(1e12, 1e7, 1.05, 1e-4)
        .expect("default memory histogram options are valid")
}
