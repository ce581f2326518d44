//! Seams to external collaborators
//!
//! The control loops only see these traits. Listing failures are returned
//! as `anyhow` errors and the calling loop step is skipped for that run.

mod snapshot;

pub use snapshot::{
    ClusterSnapshot, FileStatusWriter, LoggingEvictionClient, MemoryStatusWriter,
    PodHistoryEntry, ReplicaCount, SnapshotSource,
};

use crate::models::{
    ContainerMetricsSnapshot, ControllerRef, Labels, PodId, PodSnapshot, UsageSample, VpaId,
    VpaObject, VpaStatus,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Lists policy objects and pods
#[async_trait]
pub trait ClusterSource: Send + Sync {
    async fn list_vpas(&self) -> Result<Vec<VpaObject>>;

    async fn list_pods(&self) -> Result<Vec<PodSnapshot>>;
}

/// Point-in-time usage of every live container
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn container_metrics(&self) -> Result<Vec<ContainerMetricsSnapshot>>;
}

/// Usage history of one pod
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodHistory {
    #[serde(default)]
    pub last_labels: Labels,
    pub last_seen: Option<DateTime<Utc>>,
    /// Samples per container name, ordered by time
    #[serde(default)]
    pub samples: BTreeMap<String, Vec<UsageSample>>,
}

/// Historical usage, used once at startup
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn cluster_history(&self) -> Result<HashMap<PodId, PodHistory>>;
}

/// Writes the status sub-document of a policy object
#[async_trait]
pub trait StatusWriter: Send + Sync {
    async fn write_status(&self, id: &VpaId, status: &VpaStatus) -> Result<()>;
}

/// Evicts a single pod
#[async_trait]
pub trait EvictionClient: Send + Sync {
    async fn evict(&self, pod: &PodSnapshot) -> Result<()>;
}

/// Configured replica count of a controller
#[async_trait]
pub trait ReplicaCounter: Send + Sync {
    async fn configured_replicas(&self, owner: &ControllerRef) -> Result<Option<u32>>;
}
