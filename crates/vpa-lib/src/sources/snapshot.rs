//! File-backed implementations of the collaborator seams
//!
//! A cluster snapshot is a JSON document with policy objects, pods,
//! container metrics, replica counts and optional history. It is re-read
//! on every call so an external process can refresh it between runs.
//! Statuses written by [`FileStatusWriter`] can be layered over the
//! snapshot's policy objects with [`SnapshotSource::with_status_dir`].

use super::{
    ClusterSource, EvictionClient, HistorySource, MetricsSource, PodHistory, ReplicaCounter,
    StatusWriter,
};
use crate::checkpoint::write_json_atomic;
use crate::models::{
    ContainerMetricsSnapshot, ControllerRef, PodId, PodSnapshot, VpaId, VpaObject, VpaStatus,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Configured replicas of one controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaCount {
    pub owner: ControllerRef,
    pub replicas: u32,
}

/// History entry of one pod in a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodHistoryEntry {
    pub pod: PodId,
    #[serde(flatten)]
    pub history: PodHistory,
}

/// Everything the control loops read from the cluster, in one document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    #[serde(default)]
    pub vpas: Vec<VpaObject>,
    #[serde(default)]
    pub pods: Vec<PodSnapshot>,
    #[serde(default)]
    pub metrics: Vec<ContainerMetricsSnapshot>,
    #[serde(default)]
    pub replicas: Vec<ReplicaCount>,
    #[serde(default)]
    pub history: Vec<PodHistoryEntry>,
}

impl ClusterSnapshot {
    pub async fn load(path: &Path) -> Result<Self> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read cluster snapshot {:?}", path))?;
        serde_json::from_slice(&data)
            .with_context(|| format!("Failed to parse cluster snapshot {:?}", path))
    }
}

enum SnapshotInner {
    File(PathBuf),
    Memory(RwLock<ClusterSnapshot>),
}

/// Serves the listing seams from a cluster snapshot
pub struct SnapshotSource {
    inner: SnapshotInner,
    status_dir: Option<PathBuf>,
}

impl SnapshotSource {
    /// Read the snapshot from `path` on every call
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: SnapshotInner::File(path.into()),
            status_dir: None,
        }
    }

    /// Serve a snapshot held in memory
    pub fn in_memory(snapshot: ClusterSnapshot) -> Self {
        Self {
            inner: SnapshotInner::Memory(RwLock::new(snapshot)),
            status_dir: None,
        }
    }

    /// Overlay statuses found under `dir` onto the listed policy objects
    pub fn with_status_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.status_dir = Some(dir.into());
        self
    }

    /// Swap the in-memory snapshot. No-op for file-backed sources.
    pub async fn replace(&self, snapshot: ClusterSnapshot) {
        if let SnapshotInner::Memory(current) = &self.inner {
            *current.write().await = snapshot;
        }
    }

    pub async fn snapshot(&self) -> Result<ClusterSnapshot> {
        match &self.inner {
            SnapshotInner::File(path) => ClusterSnapshot::load(path).await,
            SnapshotInner::Memory(snapshot) => Ok(snapshot.read().await.clone()),
        }
    }
}

#[async_trait]
impl ClusterSource for SnapshotSource {
    async fn list_vpas(&self) -> Result<Vec<VpaObject>> {
        let mut vpas = self.snapshot().await?.vpas;
        if let Some(dir) = &self.status_dir {
            for vpa in &mut vpas {
                match read_status(dir, &vpa.id()).await {
                    Ok(Some(status)) => vpa.status = status,
                    Ok(None) => {}
                    // Keep the snapshot's status; the next write replaces the file
                    Err(e) => warn!(vpa = %vpa.id(), error = %e, "Ignoring unreadable status"),
                }
            }
        }
        Ok(vpas)
    }

    async fn list_pods(&self) -> Result<Vec<PodSnapshot>> {
        Ok(self.snapshot().await?.pods)
    }
}

#[async_trait]
impl MetricsSource for SnapshotSource {
    async fn container_metrics(&self) -> Result<Vec<ContainerMetricsSnapshot>> {
        Ok(self.snapshot().await?.metrics)
    }
}

#[async_trait]
impl HistorySource for SnapshotSource {
    async fn cluster_history(&self) -> Result<HashMap<PodId, PodHistory>> {
        Ok(self
            .snapshot()
            .await?
            .history
            .into_iter()
            .map(|entry| (entry.pod, entry.history))
            .collect())
    }
}

#[async_trait]
impl ReplicaCounter for SnapshotSource {
    async fn configured_replicas(&self, owner: &ControllerRef) -> Result<Option<u32>> {
        Ok(self
            .snapshot()
            .await?
            .replicas
            .into_iter()
            .find(|r| &r.owner == owner)
            .map(|r| r.replicas))
    }
}

fn status_path(root: &Path, id: &VpaId) -> PathBuf {
    root.join(&id.namespace).join(format!("{}.json", id.vpa_name))
}

async fn read_status(root: &Path, id: &VpaId) -> Result<Option<VpaStatus>> {
    let path = status_path(root, id);
    let data = match tokio::fs::read(&path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read status {:?}", path));
        }
    };
    let status = serde_json::from_slice(&data)
        .with_context(|| format!("Failed to parse status {:?}", path))?;
    Ok(Some(status))
}

/// Writes each status as `<root>/<namespace>/<name>.json`
#[derive(Debug, Clone)]
pub struct FileStatusWriter {
    root: PathBuf,
}

impl FileStatusWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, id: &VpaId) -> PathBuf {
        status_path(&self.root, id)
    }
}

#[async_trait]
impl StatusWriter for FileStatusWriter {
    async fn write_status(&self, id: &VpaId, status: &VpaStatus) -> Result<()> {
        let path = self.path_for(id);
        write_json_atomic(&path, status).await?;
        debug!(vpa = %id, path = %path.display(), "Status written");
        Ok(())
    }
}

/// Keeps the last written status of each policy object in memory
#[derive(Debug, Default)]
pub struct MemoryStatusWriter {
    statuses: DashMap<VpaId, VpaStatus>,
    writes: AtomicUsize,
}

impl MemoryStatusWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &VpaId) -> Option<VpaStatus> {
        self.statuses.get(id).map(|r| r.value().clone())
    }

    /// Number of writes made so far
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl StatusWriter for MemoryStatusWriter {
    async fn write_status(&self, id: &VpaId, status: &VpaStatus) -> Result<()> {
        self.statuses.insert(id.clone(), status.clone());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Records evictions in the log without touching any pod
#[derive(Debug, Default)]
pub struct LoggingEvictionClient {
    evicted: Mutex<Vec<PodId>>,
}

impl LoggingEvictionClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pods evicted so far, in eviction order
    pub async fn evicted(&self) -> Vec<PodId> {
        self.evicted.lock().await.clone()
    }
}

#[async_trait]
impl EvictionClient for LoggingEvictionClient {
    async fn evict(&self, pod: &PodSnapshot) -> Result<()> {
        info!(pod = %pod.id(), "Dry-run eviction");
        self.evicted.lock().await.push(pod.id());
        Ok(())
    }
}
