//! Controller configuration

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use vpa_lib::checkpoint::CheckpointWriterConfig;
use vpa_lib::recommender::RecommenderConfig;
use vpa_lib::updater::{EvictionConfig, PriorityConfig, UpdaterConfig};

/// Environment variable naming an optional configuration file
pub const CONFIG_FILE_ENV: &str = "VPA_CONFIG_FILE";

/// Controller configuration
///
/// Every field can be set from the environment with the `VPA_` prefix,
/// e.g. `VPA_RECOMMENDER_INTERVAL_SECS=30`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// API server port for health/metrics
    pub api_port: u16,

    /// Cluster snapshot read by every run
    pub snapshot_path: PathBuf,

    /// Root directory of checkpoint files
    pub checkpoint_dir: PathBuf,

    /// Root directory of status files
    pub status_dir: PathBuf,

    pub recommender_interval_secs: u64,
    pub updater_interval_secs: u64,

    /// Time budget of one checkpoint writing run
    pub checkpoints_write_timeout_secs: u64,
    /// Checkpoints written per run regardless of the time budget
    pub min_checkpoints: usize,
    pub checkpoint_gc_interval_secs: u64,
    pub aggregate_gc_interval_secs: u64,

    /// Fraction of replicas of one controller that may be evicted at once
    pub eviction_tolerance: f64,
    /// Groups with fewer live pods are never evicted from
    pub min_replicas: u32,
    /// Smallest relative request change worth an eviction
    pub min_change_priority: f64,

    pub oom_channel_capacity: usize,
    pub oom_poll_interval_secs: u64,

    /// Only track pods matched by some policy object
    pub memory_saver_mode: bool,

    /// Ingest the snapshot's usage history before the first run
    pub init_from_history: bool,

    /// Run the updater loop; evictions are logged, not executed
    pub enable_updater: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        let recommender = RecommenderConfig::default();
        let updater = UpdaterConfig::default();
        Self {
            api_port: 8080,
            snapshot_path: PathBuf::from("/var/lib/vpa/cluster.json"),
            checkpoint_dir: PathBuf::from("/var/lib/vpa/checkpoints"),
            status_dir: PathBuf::from("/var/lib/vpa/status"),
            recommender_interval_secs: recommender.interval.as_secs(),
            updater_interval_secs: updater.interval.as_secs(),
            checkpoints_write_timeout_secs: recommender.checkpoint_writer.write_timeout.as_secs(),
            min_checkpoints: recommender.checkpoint_writer.min_checkpoints,
            checkpoint_gc_interval_secs: recommender.checkpoint_gc_interval.as_secs(),
            aggregate_gc_interval_secs: recommender.aggregate_gc_interval.as_secs(),
            eviction_tolerance: updater.eviction.tolerance,
            min_replicas: updater.eviction.min_replicas,
            min_change_priority: updater.priority.min_change_priority,
            oom_channel_capacity: recommender.oom_channel_capacity,
            oom_poll_interval_secs: recommender.oom_poll_interval.as_secs(),
            memory_saver_mode: false,
            init_from_history: false,
            enable_updater: true,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from the environment and the file named by `VPA_CONFIG_FILE`
    pub fn load() -> Result<Self> {
        let file = std::env::var_os(CONFIG_FILE_ENV).map(PathBuf::from);
        Self::load_from(file.as_deref())
    }

    /// Load configuration from an optional file, overridden by the environment
    pub fn load_from(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(config::Environment::with_prefix("VPA").try_parsing(true))
            .build()
            .context("Failed to read configuration")?;

        config
            .try_deserialize()
            .context("Invalid controller configuration")
    }

    pub fn recommender_config(&self) -> RecommenderConfig {
        RecommenderConfig {
            interval: Duration::from_secs(self.recommender_interval_secs),
            checkpoint_gc_interval: Duration::from_secs(self.checkpoint_gc_interval_secs),
            aggregate_gc_interval: Duration::from_secs(self.aggregate_gc_interval_secs),
            oom_channel_capacity: self.oom_channel_capacity,
            oom_poll_interval: Duration::from_secs(self.oom_poll_interval_secs),
            memory_saver_mode: self.memory_saver_mode,
            checkpoint_writer: CheckpointWriterConfig {
                write_timeout: Duration::from_secs(self.checkpoints_write_timeout_secs),
                min_checkpoints: self.min_checkpoints,
            },
            ..Default::default()
        }
    }

    pub fn updater_config(&self) -> UpdaterConfig {
        UpdaterConfig {
            interval: Duration::from_secs(self.updater_interval_secs),
            priority: PriorityConfig {
                min_change_priority: self.min_change_priority,
                ..Default::default()
            },
            eviction: EvictionConfig {
                min_replicas: self.min_replicas,
                tolerance: self.eviction_tolerance,
            },
        }
    }
}
