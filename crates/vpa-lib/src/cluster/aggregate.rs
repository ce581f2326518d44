//! Usage history shared by equivalent containers
//!
//! One `AggregateContainerState` exists per aggregation key (namespace,
//! container name, label set). Pods come and go; the aggregate outlives
//! them until it expires.

use super::labels::LabelSetId;
use crate::error::{CheckpointError, HistogramError};
use crate::histogram::{
    cpu_histogram_options, memory_histogram_options, DecayingHistogram, HistogramCheckpoint,
    HistogramOptions,
};
use crate::models::{
    bytes_from_memory_amount, cores_from_cpu_amount, ContainerResourcePolicy,
    ContainerScalingMode, ResourceKind, Resources, UpdateMode, UsageSample,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Version tag written into every checkpoint
pub const CHECKPOINT_VERSION: &str = "v3";

/// Tunables of the aggregation model
#[derive(Debug, Clone, Copy)]
pub struct AggregationsConfig {
    /// Length of one memory peak window
    pub memory_aggregation_interval: Duration,
    /// Number of windows kept before an aggregate expires
    pub memory_aggregation_interval_count: i32,
    pub memory_histogram_decay_half_life: Duration,
    pub cpu_histogram_decay_half_life: Duration,
    /// Multiplier applied to memory usage after an OOM kill
    pub oom_bump_up_ratio: f64,
    /// Minimum absolute bump after an OOM kill, in bytes
    pub oom_min_bump_up_bytes: f64,
    /// Floor on the weight of a CPU sample, in cores
    pub min_sample_weight: f64,
    pub cpu_histogram_options: HistogramOptions,
    pub memory_histogram_options: HistogramOptions,
}

impl Default for AggregationsConfig {
    fn default() -> Self {
        Self {
            memory_aggregation_interval: Duration::hours(24),
            memory_aggregation_interval_count: 8,
            memory_histogram_decay_half_life: Duration::hours(24),
            cpu_histogram_decay_half_life: Duration::hours(24),
            oom_bump_up_ratio: 1.2,
            oom_min_bump_up_bytes: 100.0 * 1024.0 * 1024.0,
            min_sample_weight: 0.1,
            cpu_histogram_options: cpu_histogram_options(),
            memory_histogram_options: memory_histogram_options(),
        }
    }
}

impl AggregationsConfig {
    /// How long usage history is retained
    pub fn aggregation_window_length(&self) -> Duration {
        self.memory_aggregation_interval * self.memory_aggregation_interval_count
    }
}

/// Identity under which usage history is grouped
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AggregationKey {
    pub namespace: String,
    pub container_name: String,
    pub labels: LabelSetId,
}

impl AggregationKey {
    pub fn new(namespace: impl Into<String>, container_name: impl Into<String>, labels: LabelSetId) -> Self {
        Self {
            namespace: namespace.into(),
            container_name: container_name.into(),
            labels,
        }
    }
}

impl fmt::Display for AggregationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.container_name, self.labels)
    }
}

/// Sink for usage samples routed from a container
pub trait SampleAggregator {
    fn add_sample(&mut self, sample: &UsageSample);

    /// Remove a previously added memory peak
    fn subtract_sample(&mut self, sample: &UsageSample);
}

/// Persisted form of an aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateStateCheckpoint {
    pub version: String,
    pub last_update_time: DateTime<Utc>,
    pub cpu_histogram: HistogramCheckpoint,
    pub memory_histogram: HistogramCheckpoint,
    #[serde(default)]
    pub first_sample_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_sample_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_samples_count: u64,
}

/// CPU usage and memory peak history of a group of equivalent containers
#[derive(Debug, Clone)]
pub struct AggregateContainerState {
    cpu_histogram: DecayingHistogram,
    memory_peaks_histogram: DecayingHistogram,
    first_sample_start: Option<DateTime<Utc>>,
    last_sample_start: Option<DateTime<Utc>>,
    total_samples_count: u64,
    creation_time: DateTime<Utc>,
    min_sample_weight: f64,
    /// Last uncapped target recommended for this aggregate
    pub last_recommendation: Resources,
    pub is_under_vpa: bool,
    pub update_mode: Option<UpdateMode>,
    pub scaling_mode: ContainerScalingMode,
    pub controlled_resources: Vec<ResourceKind>,
}

impl AggregateContainerState {
    pub fn new(config: &AggregationsConfig, creation_time: DateTime<Utc>) -> Self {
        Self {
            cpu_histogram: DecayingHistogram::new(
                config.cpu_histogram_options,
                config.cpu_histogram_decay_half_life,
            ),
            memory_peaks_histogram: DecayingHistogram::new(
                config.memory_histogram_options,
                config.memory_histogram_decay_half_life,
            ),
            first_sample_start: None,
            last_sample_start: None,
            total_samples_count: 0,
            creation_time,
            min_sample_weight: config.min_sample_weight,
            last_recommendation: Resources::new(),
            is_under_vpa: false,
            update_mode: None,
            scaling_mode: ContainerScalingMode::Auto,
            controlled_resources: ResourceKind::ALL.to_vec(),
        }
    }

    pub fn cpu_histogram(&self) -> &DecayingHistogram {
        &self.cpu_histogram
    }

    pub fn memory_peaks_histogram(&self) -> &DecayingHistogram {
        &self.memory_peaks_histogram
    }

    pub fn first_sample_start(&self) -> Option<DateTime<Utc>> {
        self.first_sample_start
    }

    pub fn last_sample_start(&self) -> Option<DateTime<Utc>> {
        self.last_sample_start
    }

    /// Number of CPU samples aggregated so far
    pub fn total_samples_count(&self) -> u64 {
        self.total_samples_count
    }

    pub fn creation_time(&self) -> DateTime<Utc> {
        self.creation_time
    }

    pub fn is_empty(&self) -> bool {
        self.total_samples_count == 0
    }

    fn add_cpu_sample(&mut self, sample: &UsageSample) {
        let cores = cores_from_cpu_amount(sample.usage);
        let weight = cores_from_cpu_amount(sample.request).max(self.min_sample_weight);
        self.cpu_histogram
            .add_sample(cores, weight, sample.measure_start);
        if self
            .last_sample_start
            .map_or(true, |last| sample.measure_start > last)
        {
            self.last_sample_start = Some(sample.measure_start);
        }
        if self
            .first_sample_start
            .map_or(true, |first| sample.measure_start < first)
        {
            self.first_sample_start = Some(sample.measure_start);
        }
        self.total_samples_count += 1;
    }

    /// Fold another aggregate into this one
    pub fn merge(&mut self, other: &AggregateContainerState) -> Result<(), HistogramError> {
        self.cpu_histogram.merge(&other.cpu_histogram)?;
        self.memory_peaks_histogram
            .merge(&other.memory_peaks_histogram)?;
        self.first_sample_start = match (self.first_sample_start, other.first_sample_start) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.last_sample_start = self.last_sample_start.max(other.last_sample_start);
        self.total_samples_count += other.total_samples_count;
        Ok(())
    }

    pub fn save_to_checkpoint(&self, now: DateTime<Utc>) -> AggregateStateCheckpoint {
        AggregateStateCheckpoint {
            version: CHECKPOINT_VERSION.to_string(),
            last_update_time: now,
            cpu_histogram: self.cpu_histogram.save_to_checkpoint(),
            memory_histogram: self.memory_peaks_histogram.save_to_checkpoint(),
            first_sample_start: self.first_sample_start,
            last_sample_start: self.last_sample_start,
            total_samples_count: self.total_samples_count,
        }
    }

    /// Restore histograms and counters from a checkpoint
    ///
    /// On error the aggregate is left exactly as it was.
    pub fn load_from_checkpoint(
        &mut self,
        checkpoint: &AggregateStateCheckpoint,
    ) -> Result<(), CheckpointError> {
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::UnsupportedVersion {
                found: checkpoint.version.clone(),
                expected: CHECKPOINT_VERSION.to_string(),
            });
        }
        let mut memory = self.memory_peaks_histogram.clone();
        memory
            .load_from_checkpoint(&checkpoint.memory_histogram)
            .map_err(|source| CheckpointError::Histogram {
                resource: "memory",
                source,
            })?;
        let mut cpu = self.cpu_histogram.clone();
        cpu.load_from_checkpoint(&checkpoint.cpu_histogram)
            .map_err(|source| CheckpointError::Histogram {
                resource: "cpu",
                source,
            })?;

        self.memory_peaks_histogram = memory;
        self.cpu_histogram = cpu;
        self.total_samples_count = checkpoint.total_samples_count;
        self.first_sample_start = checkpoint.first_sample_start;
        self.last_sample_start = checkpoint.last_sample_start;
        Ok(())
    }

    /// An aggregate expires once no sample arrived for a whole window,
    /// or, if it never got one, a window after its creation
    pub fn is_expired(&self, now: DateTime<Utc>, window: Duration) -> bool {
        match self.last_sample_start {
            Some(last) if !self.is_empty() => now - last >= window,
            _ => now - self.creation_time >= window,
        }
    }

    /// Apply the scaling mode and controlled resources of a container policy
    pub fn update_from_policy(&mut self, policy: Option<&ContainerResourcePolicy>) {
        self.scaling_mode = policy.and_then(|p| p.mode).unwrap_or_default();
        self.controlled_resources = policy
            .and_then(|p| p.controlled_resources.clone())
            .unwrap_or_else(|| ResourceKind::ALL.to_vec());
    }

    /// Detach from any policy object
    pub fn mark_not_autoscaled(&mut self) {
        self.is_under_vpa = false;
        self.last_recommendation.clear();
        self.update_mode = None;
    }

    pub fn needs_recommendation(&self) -> bool {
        self.is_under_vpa && self.scaling_mode == ContainerScalingMode::Auto
    }
}

impl SampleAggregator for AggregateContainerState {
    fn add_sample(&mut self, sample: &UsageSample) {
        match sample.resource {
            ResourceKind::Cpu => self.add_cpu_sample(sample),
            ResourceKind::Memory => self.memory_peaks_histogram.add_sample(
                bytes_from_memory_amount(sample.usage),
                1.0,
                sample.measure_start,
            ),
        }
    }

    /// # Panics
    ///
    /// Panics on CPU samples; only memory peaks are ever withdrawn.
    fn subtract_sample(&mut self, sample: &UsageSample) {
        match sample.resource {
            ResourceKind::Memory => self.memory_peaks_histogram.subtract_sample(
                bytes_from_memory_amount(sample.usage),
                1.0,
                sample.measure_start,
            ),
            ResourceKind::Cpu => panic!("only memory samples can be subtracted"),
        }
    }
}
