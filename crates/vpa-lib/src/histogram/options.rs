//! Bucketing schemes for histograms

use crate::error::HistogramError;

/// Bucket layout of a histogram
///
/// Two histograms can only be merged when their options compare equal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HistogramOptions {
    /// Buckets of equal size: bucket `i` starts at `i * bucket_size`
    Linear {
        num_buckets: usize,
        bucket_size: f64,
        epsilon: f64,
    },
    /// Bucket sizes grow geometrically by `ratio`, starting at `first_bucket_size`
    Exponential {
        num_buckets: usize,
        first_bucket_size: f64,
        ratio: f64,
        epsilon: f64,
    },
}

impl HistogramOptions {
    /// Linear buckets covering `[0, max_value]`
    pub fn linear(max_value: f64, bucket_size: f64, epsilon: f64) -> Result<Self, HistogramError> {
        if !(max_value > 0.0 && bucket_size > 0.0 && epsilon > 0.0) {
            return Err(HistogramError::InvalidOptions(format!(
                "max_value, bucket_size and epsilon must be positive (got {max_value}, {bucket_size}, {epsilon})"
            )));
        }
        let num_buckets = (max_value / bucket_size).ceil() as usize + 1;
        Ok(HistogramOptions::Linear {
            num_buckets,
            bucket_size,
            epsilon,
        })
    }

    /// Exponentially growing buckets covering `[0, max_value]`
    pub fn exponential(
        max_value: f64,
        first_bucket_size: f64,
        ratio: f64,
        epsilon: f64,
    ) -> Result<Self, HistogramError> {
        if !(max_value > 0.0 && first_bucket_size > 0.0 && epsilon > 0.0) {
            return Err(HistogramError::InvalidOptions(format!(
                "max_value, first_bucket_size and epsilon must be positive (got {max_value}, {first_bucket_size}, {epsilon})"
            )));
        }
        if ratio <= 1.0 {
            return Err(HistogramError::InvalidOptions(format!(
                "ratio must be greater than 1 (got {ratio})"
            )));
        }
        let num_buckets = ((max_value * (ratio - 1.0) / first_bucket_size + 1.0).ln() / ratio.ln())
            .ceil() as usize
            + 1;
        Ok(HistogramOptions::Exponential {
            num_buckets,
            first_bucket_size,
            ratio,
            epsilon,
        })
    }

    pub fn num_buckets(&self) -> usize {
        match *self {
            HistogramOptions::Linear { num_buckets, .. } => num_buckets,
            HistogramOptions::Exponential { num_buckets, .. } => num_buckets,
        }
    }

    /// Weights below epsilon count as zero
    pub fn epsilon(&self) -> f64 {
        match *self {
            HistogramOptions::Linear { epsilon, .. } => epsilon,
            HistogramOptions::Exponential { epsilon, .. } => epsilon,
        }
    }

    /// Index of the bucket holding `value`. Values past the range land in the last bucket.
    pub fn find_bucket(&self, value: f64) -> usize {
        let last = self.num_buckets() - 1;
        match *self {
            HistogramOptions::Linear { bucket_size, .. } => {
                if value <= 0.0 {
                    return 0;
                }
                ((value / bucket_size) as usize).min(last)
            }
            HistogramOptions::Exponential {
                first_bucket_size,
                ratio,
                ..
            } => {
                if value < first_bucket_size {
                    return 0;
                }
                let bucket =
                    ((value * (ratio - 1.0) / first_bucket_size + 1.0).ln() / ratio.ln()) as usize;
                bucket.min(last)
            }
        }
    }

    /// Lower boundary of a bucket
    ///
    /// # Panics
    ///
    /// Panics if `bucket` is not a valid index.
    pub fn bucket_start(&self, bucket: usize) -> f64 {
        assert!(
            bucket < self.num_buckets(),
            "bucket index {bucket} out of range"
        );
        match *self {
            HistogramOptions::Linear { bucket_size, .. } => bucket as f64 * bucket_size,
            HistogramOptions::Exponential {
                first_bucket_size,
                ratio,
                ..
            } => {
                if bucket == 0 {
                    0.0
                } else {
                    first_bucket_size * (ratio.powi(bucket as i32) - 1.0) / (ratio - 1.0)
                }
            }
        }
    }
}
