//! Checkpoint persistence
//!
//! Aggregated histograms are saved per (policy object, container) so
//! history survives a restart:
//! - `store`: the `CheckpointStore` seam with file and in-memory backends
//! - `writer`: time-boxed, fair checkpoint writing from the cluster state

mod store;
mod writer;

pub(crate) use store::write_json_atomic;
pub use store::{FileCheckpointStore, MemoryCheckpointStore};
pub use writer::{
    aggregate_states_for_checkpoint, CheckpointRunStats, CheckpointWriter, CheckpointWriterConfig,
};

use crate::cluster::AggregateStateCheckpoint;
use crate::models::VpaId;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Persisted history of one container of one policy object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VpaCheckpoint {
    pub namespace: String,
    /// Object name, `<vpa>-<container>`
    pub name: String,
    pub vpa_name: String,
    pub container_name: String,
    pub status: AggregateStateCheckpoint,
}

impl VpaCheckpoint {
    pub fn new(vpa: &VpaId, container_name: &str, status: AggregateStateCheckpoint) -> Self {
        Self {
            namespace: vpa.namespace.clone(),
            name: checkpoint_name(&vpa.vpa_name, container_name),
            vpa_name: vpa.vpa_name.clone(),
            container_name: container_name.to_string(),
            status,
        }
    }

    pub fn vpa_id(&self) -> VpaId {
        VpaId::new(self.namespace.clone(), self.vpa_name.clone())
    }
}

pub fn checkpoint_name(vpa_name: &str, container_name: &str) -> String {
    format!("{}-{}", vpa_name, container_name)
}

/// Storage for checkpoint records
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// List checkpoints of one namespace, or of all namespaces for `None`
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<VpaCheckpoint>>;

    /// Create or replace a checkpoint
    async fn save(&self, checkpoint: &VpaCheckpoint) -> Result<()>;

    /// Delete a checkpoint. Deleting a missing checkpoint is not an error.
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}
