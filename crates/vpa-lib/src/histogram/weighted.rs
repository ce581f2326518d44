//! Fixed-bucket weighted histogram

use super::{HistogramCheckpoint, HistogramOptions, MAX_CHECKPOINT_WEIGHT};
use crate::error::HistogramError;
use std::collections::BTreeMap;

/// Weighted distribution of values over fixed buckets
///
/// `min_bucket`/`max_bucket` bound the buckets holding non-negligible
/// weight. An empty histogram has `min_bucket` at the last bucket and
/// `max_bucket` at zero.
#[derive(Debug, Clone)]
pub struct Histogram {
    options: HistogramOptions,
    bucket_weight: Vec<f64>,
    total_weight: f64,
    min_bucket: usize,
    max_bucket: usize,
}

impl Histogram {
    pub fn new(options: HistogramOptions) -> Self {
        let num_buckets = options.num_buckets();
        Self {
            options,
            bucket_weight: vec![0.0; num_buckets],
            total_weight: 0.0,
            min_bucket: num_buckets - 1,
            max_bucket: 0,
        }
    }

    pub fn options(&self) -> &HistogramOptions {
        &self.options
    }

    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    /// Add `weight` to the bucket holding `value`
    ///
    /// # Panics
    ///
    /// Panics if `weight` is negative.
    pub fn add_sample(&mut self, value: f64, weight: f64) {
        assert!(weight >= 0.0, "sample weight must be non-negative, got {weight}");
        let bucket = self.options.find_bucket(value);
        self.bucket_weight[bucket] += weight;
        self.total_weight += weight;
        let epsilon = self.options.epsilon();
        if bucket < self.min_bucket && self.bucket_weight[bucket] >= epsilon {
            self.min_bucket = bucket;
        }
        if bucket > self.max_bucket && self.bucket_weight[bucket] >= epsilon {
            self.max_bucket = bucket;
        }
    }

    /// Remove `weight` from the bucket holding `value`, never going below zero
    ///
    /// # Panics
    ///
    /// Panics if `weight` is negative.
    pub fn subtract_sample(&mut self, value: f64, weight: f64) {
        assert!(weight >= 0.0, "sample weight must be non-negative, got {weight}");
        let bucket = self.options.find_bucket(value);
        let epsilon = self.options.epsilon();
        // Snap to zero rather than leave a residue below epsilon
        let weight = if weight > self.bucket_weight[bucket] - epsilon {
            self.bucket_weight[bucket]
        } else {
            weight
        };
        self.total_weight -= weight;
        self.bucket_weight[bucket] -= weight;
        self.update_min_and_max_bucket();
    }

    /// Smallest bucket boundary such that at least `p * total` weight lies below it
    ///
    /// Returns the start of the bucket after the one where the threshold is
    /// crossed, or the last bucket's own start. Empty histograms yield 0.
    pub fn percentile(&self, p: f64) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        let threshold = p * self.total_weight;
        let mut partial_sum = 0.0;
        let mut bucket = self.min_bucket;
        while bucket < self.max_bucket {
            partial_sum += self.bucket_weight[bucket];
            if partial_sum >= threshold {
                break;
            }
            bucket += 1;
        }
        if bucket < self.options.num_buckets() - 1 {
            self.options.bucket_start(bucket + 1)
        } else {
            self.options.bucket_start(bucket)
        }
    }

    /// Add every bucket of `other` into this histogram
    pub fn merge(&mut self, other: &Histogram) -> Result<(), HistogramError> {
        if self.options != other.options {
            return Err(HistogramError::OptionsMismatch);
        }
        if other.min_bucket <= other.max_bucket {
            for bucket in other.min_bucket..=other.max_bucket {
                self.bucket_weight[bucket] += other.bucket_weight[bucket];
            }
        }
        self.total_weight += other.total_weight;
        self.min_bucket = self.min_bucket.min(other.min_bucket);
        self.max_bucket = self.max_bucket.max(other.max_bucket);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.bucket_weight[self.min_bucket] < self.options.epsilon()
    }

    /// Multiply every weight by `factor`
    ///
    /// # Panics
    ///
    /// Panics if `factor` is negative.
    pub fn scale(&mut self, factor: f64) {
        assert!(factor >= 0.0, "scale factor must be non-negative, got {factor}");
        if self.min_bucket <= self.max_bucket {
            for bucket in self.min_bucket..=self.max_bucket {
                self.bucket_weight[bucket] *= factor;
            }
        }
        self.total_weight *= factor;
        self.update_min_and_max_bucket();
    }

    fn update_min_and_max_bucket(&mut self) {
        let epsilon = self.options.epsilon();
        let last_bucket = self.options.num_buckets() - 1;
        while self.bucket_weight[self.min_bucket] < epsilon && self.min_bucket < last_bucket {
            self.min_bucket += 1;
        }
        while self.bucket_weight[self.max_bucket] < epsilon && self.max_bucket > 0 {
            self.max_bucket -= 1;
        }
    }

    /// Lossy integer encoding: the heaviest bucket maps to `MAX_CHECKPOINT_WEIGHT`
    /// and buckets that round to zero are dropped.
    pub fn save_to_checkpoint(&self) -> HistogramCheckpoint {
        let mut bucket_weights = BTreeMap::new();
        if self.min_bucket <= self.max_bucket {
            let max_weight = self.bucket_weight[self.min_bucket..=self.max_bucket]
                .iter()
                .cloned()
                .fold(0.0_f64, f64::max);
            if max_weight > 0.0 {
                let ratio = f64::from(MAX_CHECKPOINT_WEIGHT) / max_weight;
                for bucket in self.min_bucket..=self.max_bucket {
                    let weight = (self.bucket_weight[bucket] * ratio).round();
                    if weight > 0.0 {
                        bucket_weights.insert(bucket, weight as u32);
                    }
                }
            }
        }
        HistogramCheckpoint {
            reference_timestamp: None,
            bucket_weights,
            total_weight: self.total_weight,
        }
    }

    /// Add the weights stored in `checkpoint`, rescaled to its total weight
    ///
    /// The checkpoint is validated before anything is mutated.
    pub fn load_from_checkpoint(
        &mut self,
        checkpoint: &HistogramCheckpoint,
    ) -> Result<(), HistogramError> {
        if !checkpoint.total_weight.is_finite() || checkpoint.total_weight < 0.0 {
            return Err(HistogramError::InvalidTotalWeight(checkpoint.total_weight));
        }
        let num_buckets = self.options.num_buckets();
        let mut sum: u64 = 0;
        for (&bucket, &weight) in &checkpoint.bucket_weights {
            if bucket >= num_buckets {
                return Err(HistogramError::BucketOutOfRange {
                    bucket,
                    num_buckets,
                });
            }
            sum += u64::from(weight);
        }
        if sum == 0 {
            return Ok(());
        }
        let ratio = checkpoint.total_weight / sum as f64;
        for (&bucket, &weight) in &checkpoint.bucket_weights {
            self.min_bucket = self.min_bucket.min(bucket);
            self.max_bucket = self.max_bucket.max(bucket);
            self.bucket_weight[bucket] += f64::from(weight) * ratio;
        }
        self.total_weight += checkpoint.total_weight;
        Ok(())
    }
}
