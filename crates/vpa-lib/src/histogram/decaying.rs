//! Histogram whose samples lose weight exponentially with age

use super::{Histogram, HistogramCheckpoint, HistogramOptions};
use crate::error::HistogramError;
use chrono::{DateTime, Duration, Utc};

/// Number of half-lives after which the reference timestamp is rebased
pub const MAX_DECAY_EXPONENT: i32 = 100;

/// Weighted histogram where a sample at time `t` is scaled by
/// `2^((t - reference) / half_life)`
///
/// Newer samples therefore weigh more. The reference moves forward in
/// whole half-lives whenever the exponent would exceed
/// `MAX_DECAY_EXPONENT`, rescaling the stored weights to match.
#[derive(Debug, Clone)]
pub struct DecayingHistogram {
    histogram: Histogram,
    half_life: Duration,
    reference_timestamp: DateTime<Utc>,
}

impl DecayingHistogram {
    pub fn new(options: HistogramOptions, half_life: Duration) -> Self {
        Self {
            histogram: Histogram::new(options),
            half_life,
            reference_timestamp: DateTime::<Utc>::default(),
        }
    }

    pub fn half_life(&self) -> Duration {
        self.half_life
    }

    pub fn reference_timestamp(&self) -> DateTime<Utc> {
        self.reference_timestamp
    }

    pub fn total_weight(&self) -> f64 {
        self.histogram.total_weight()
    }

    pub fn is_empty(&self) -> bool {
        self.histogram.is_empty()
    }

    pub fn percentile(&self, p: f64) -> f64 {
        self.histogram.percentile(p)
    }

    /// # Panics
    ///
    /// Panics if `weight` is negative.
    pub fn add_sample(&mut self, value: f64, weight: f64, time: DateTime<Utc>) {
        let factor = self.decay_factor(time);
        self.histogram.add_sample(value, weight * factor);
    }

    /// # Panics
    ///
    /// Panics if `weight` is negative.
    pub fn subtract_sample(&mut self, value: f64, weight: f64, time: DateTime<Utc>) {
        let factor = self.decay_factor(time);
        self.histogram.subtract_sample(value, weight * factor);
    }

    /// Merge `other` after aligning both sides on the later reference timestamp
    pub fn merge(&mut self, other: &DecayingHistogram) -> Result<(), HistogramError> {
        if self.half_life != other.half_life {
            return Err(HistogramError::HalfLifeMismatch {
                left: self.half_life.num_seconds(),
                right: other.half_life.num_seconds(),
            });
        }
        if self.reference_timestamp < other.reference_timestamp {
            self.shift_reference_timestamp(other.reference_timestamp);
        } else if other.reference_timestamp < self.reference_timestamp {
            let mut aligned = other.clone();
            aligned.shift_reference_timestamp(self.reference_timestamp);
            return self.histogram.merge(&aligned.histogram);
        }
        self.histogram.merge(&other.histogram)
    }

    pub fn save_to_checkpoint(&self) -> HistogramCheckpoint {
        let mut checkpoint = self.histogram.save_to_checkpoint();
        checkpoint.reference_timestamp = Some(self.reference_timestamp);
        checkpoint
    }

    pub fn load_from_checkpoint(
        &mut self,
        checkpoint: &HistogramCheckpoint,
    ) -> Result<(), HistogramError> {
        self.histogram.load_from_checkpoint(checkpoint)?;
        if let Some(reference) = checkpoint.reference_timestamp {
            self.reference_timestamp = reference;
        }
        Ok(())
    }

    fn decay_factor(&mut self, time: DateTime<Utc>) -> f64 {
        let max_allowed = self.reference_timestamp + self.half_life * MAX_DECAY_EXPONENT;
        if time > max_allowed {
            self.shift_reference_timestamp(time);
        }
        let elapsed = (time - self.reference_timestamp).num_milliseconds() as f64;
        (elapsed / self.half_life.num_milliseconds() as f64).exp2()
    }

    /// Move the reference to `new_reference` rounded to a whole half-life,
    /// scaling all weights by `2^((old - new) / half_life)`
    fn shift_reference_timestamp(&mut self, new_reference: DateTime<Utc>) {
        let new_reference = round_to_multiple(new_reference, self.half_life);
        let exponent = ((self.reference_timestamp - new_reference).num_milliseconds() as f64
            / self.half_life.num_milliseconds() as f64)
            .round();
        self.histogram.scale(exponent.exp2());
        self.reference_timestamp = new_reference;
    }
}

/// Round a timestamp to the nearest multiple of `step` since the Unix epoch
fn round_to_multiple(time: DateTime<Utc>, step: Duration) -> DateTime<Utc> {
    let step_ms = step.num_milliseconds();
    if step_ms <= 0 {
        return time;
    }
    let millis = time.timestamp_millis();
    let remainder = millis.rem_euclid(step_ms);
    let offset = if remainder * 2 >= step_ms {
        step_ms - remainder
    } else {
        -remainder
    };
    time + Duration::milliseconds(offset)
}
