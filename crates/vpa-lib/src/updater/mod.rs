//! Updater control loop
//!
//! Evicts pods whose requests drifted away from their recommendation so
//! they are recreated with new requests:
//! - `eviction`: per replica group eviction budget
//! - `priority`: which pods to update, in which order
//! - `admission`: pluggable veto applied in priority order
//! - `loop`: the periodic run itself

mod admission;
mod eviction;
mod r#loop;
mod priority;


pub use admission::{AdmitAll, PodEvictionAdmission, SequentialAdmission};
pub use eviction::{
    EvictionConfig, EvictionRestrictionFactory, PodsEvictionRestriction, ReplicaGroupStats,
};
pub use priority::{PodPriority, PrioritizedPod, PriorityConfig, UpdatePriorityCalculator};
pub use r#loop::{controlling_vpa, Updater, UpdaterRunStats};

use std::time::Duration;

/// Configuration for the updater loop
#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    /// Time between two runs (default: 1 minute)
    pub interval: Duration,
    pub priority: PriorityConfig,
    pub eviction: EvictionConfig,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            priority: PriorityConfig::default(),
            eviction: EvictionConfig::default(),
        }
    }
}
