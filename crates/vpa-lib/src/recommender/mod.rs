//! Recommender control loop
//!
//! Periodically refreshes the cluster state from the collaborator seams,
//! recomputes recommendations for every policy object, writes statuses
//! and checkpoints, and garbage-collects history:
//! - `feeder`: loads objects, pods, samples, OOM events and checkpoints
//! - `oom`: detects OOM kills and queues them for the loop
//! - `loop`: the periodic run itself

mod feeder;
mod r#loop;
mod oom;

pub use feeder::{ClusterStateFeeder, SampleLoadStats};
pub use oom::{OomInfo, OomObserver, DEFAULT_OOM_CHANNEL_CAPACITY};
pub use r#loop::{Recommender, RecommenderRunStats};

use crate::checkpoint::{CheckpointStore, CheckpointWriterConfig};
use crate::cluster::AggregationsConfig;
use crate::estimator::EstimatorConfig;
use crate::sources::{ClusterSource, MetricsSource, StatusWriter};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for the recommender loop
#[derive(Debug, Clone)]
pub struct RecommenderConfig {
    /// Time between two runs (default: 1 minute)
    pub interval: Duration,
    /// Time between two checkpoint garbage collections (default: 10 minutes)
    pub checkpoint_gc_interval: Duration,
    /// Minimum time between two aggregate garbage collections (default: 1 hour)
    pub aggregate_gc_interval: Duration,
    /// Capacity of the OOM event channel
    pub oom_channel_capacity: usize,
    /// How often the OOM observer lists pods
    pub oom_poll_interval: Duration,
    /// Only track pods matched by some policy object
    pub memory_saver_mode: bool,
    pub aggregations: AggregationsConfig,
    pub estimator: EstimatorConfig,
    pub checkpoint_writer: CheckpointWriterConfig,
}

impl Default for RecommenderConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            checkpoint_gc_interval: Duration::from_secs(600),
            aggregate_gc_interval: Duration::from_secs(3600),
            oom_channel_capacity: DEFAULT_OOM_CHANNEL_CAPACITY,
            oom_poll_interval: Duration::from_secs(10),
            memory_saver_mode: false,
            aggregations: AggregationsConfig::default(),
            estimator: EstimatorConfig::default(),
            checkpoint_writer: CheckpointWriterConfig::default(),
        }
    }
}

/// Collaborators the recommender reads from and writes to
#[derive(Clone)]
pub struct RecommenderSources {
    pub cluster: Arc<dyn ClusterSource>,
    pub metrics: Arc<dyn MetricsSource>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub status: Arc<dyn StatusWriter>,
}
