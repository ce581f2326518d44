//! Cluster state feeder
//!
//! Loads policy objects, pods, usage samples, OOM events and checkpoints
//! from the collaborator seams into the `ClusterState`.

use super::oom::OomInfo;
use crate::checkpoint::CheckpointStore;
use crate::cluster::ClusterState;
use crate::error::ClusterStateError;
use crate::models::{
    ContainerId, KeyedUsageSample, PodId, PodPhase, Resources, UsageSample, VpaId,
};
use crate::observability::{ControllerMetrics, StructuredLogger};
use crate::sources::{ClusterSource, HistorySource, MetricsSource};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Outcome of one metrics load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleLoadStats {
    pub added: usize,
    pub rejected: usize,
    pub dropped: usize,
}

/// Moves data from the collaborator seams into the cluster state
pub struct ClusterStateFeeder {
    cluster_source: Arc<dyn ClusterSource>,
    metrics_source: Arc<dyn MetricsSource>,
    checkpoint_store: Arc<dyn CheckpointStore>,
    oom_rx: mpsc::Receiver<OomInfo>,
    memory_saver_mode: bool,
    metrics: ControllerMetrics,
    logger: StructuredLogger,
}

impl ClusterStateFeeder {
    pub fn new(
        cluster_source: Arc<dyn ClusterSource>,
        metrics_source: Arc<dyn MetricsSource>,
        checkpoint_store: Arc<dyn CheckpointStore>,
        oom_rx: mpsc::Receiver<OomInfo>,
        memory_saver_mode: bool,
    ) -> Self {
        Self {
            cluster_source,
            metrics_source,
            checkpoint_store,
            oom_rx,
            memory_saver_mode,
            metrics: ControllerMetrics::new(),
            logger: StructuredLogger::new("recommender"),
        }
    }

    /// Sync policy objects with the store
    ///
    /// Objects gone from the store are removed. On a listing failure the
    /// state is left untouched.
    pub async fn load_vpas(&self, cluster: &mut ClusterState) -> Result<()> {
        let objects = self.cluster_source.list_vpas().await?;

        let listed: HashSet<VpaId> = objects.iter().map(|o| o.id()).collect();
        let removed: Vec<VpaId> = cluster
            .vpas()
            .map(|vpa| vpa.id.clone())
            .filter(|id| !listed.contains(id))
            .collect();
        for id in removed {
            debug!(vpa = %id, "Policy object removed");
            if let Err(e) = cluster.delete_vpa(&id) {
                warn!(vpa = %id, error = %e, "Failed to delete policy object");
            }
        }

        for object in &objects {
            if let Err(e) = cluster.add_or_update_vpa(object) {
                warn!(vpa = %object.id(), error = %e, "Failed to add policy object");
            }
        }
        cluster.observed_vpas = objects;
        Ok(())
    }

    /// Sync pods and their container requests with the store
    pub async fn load_pods(&self, cluster: &mut ClusterState, now: DateTime<Utc>) -> Result<()> {
        let pods = self.cluster_source.list_pods().await?;

        let listed: HashSet<PodId> = pods.iter().map(|p| p.id()).collect();
        let removed: Vec<PodId> = cluster
            .pods()
            .map(|pod| pod.id.clone())
            .filter(|id| !listed.contains(id))
            .collect();
        for id in &removed {
            cluster.delete_pod(id);
        }

        for pod in &pods {
            if self.memory_saver_mode && !cluster.is_matched_by_any_vpa(&pod.namespace, &pod.labels)
            {
                continue;
            }
            let id = pod.id();
            cluster.add_or_update_pod(id.clone(), &pod.labels, pod.phase, now);
            for container in &pod.containers {
                let container_id = ContainerId::new(id.clone(), container.name.clone());
                if let Err(e) =
                    cluster.add_or_update_container(&container_id, container.requests.clone(), now)
                {
                    warn!(container = %container_id, error = %e, "Failed to add container");
                }
            }
        }
        debug!(pods = cluster.pod_count(), removed = removed.len(), "Pods loaded");
        Ok(())
    }

    /// Turn the current usage snapshot into samples
    ///
    /// Each container yields one CPU and one memory sample. Samples for
    /// unknown containers are dropped and counted.
    pub async fn load_realtime_metrics(&self, cluster: &mut ClusterState) -> Result<SampleLoadStats> {
        let snapshots = self.metrics_source.container_metrics().await?;
        let mut stats = SampleLoadStats::default();

        for snapshot in snapshots {
            for (&resource, &usage) in &snapshot.usage {
                let request = match cluster.container(&snapshot.container) {
                    Ok(container) => container.request.get(&resource).copied().unwrap_or_default(),
                    Err(e) => {
                        self.count_drop(&e, &mut stats);
                        continue;
                    }
                };
                let sample = KeyedUsageSample {
                    container: snapshot.container.clone(),
                    sample: UsageSample {
                        measure_start: snapshot.snapshot_time,
                        resource,
                        usage,
                        request,
                    },
                };
                match cluster.add_sample(&sample) {
                    Ok(true) => stats.added += 1,
                    Ok(false) => stats.rejected += 1,
                    Err(e) => self.count_drop(&e, &mut stats),
                }
            }
        }

        debug!(
            added = stats.added,
            rejected = stats.rejected,
            dropped = stats.dropped,
            "Realtime metrics loaded"
        );
        Ok(stats)
    }

    fn count_drop(&self, error: &ClusterStateError, stats: &mut SampleLoadStats) {
        // Untracked pods are expected in memory saver mode
        if self.memory_saver_mode && matches!(error, ClusterStateError::PodNotFound(_)) {
            return;
        }
        stats.dropped += 1;
        self.metrics.inc_samples_dropped();
        debug!(error = %error, "Dropping usage sample");
    }

    /// Record every queued OOM event without waiting for more
    pub fn drain_oom(&mut self, cluster: &mut ClusterState) -> usize {
        let mut recorded = 0;
        while let Ok(info) = self.oom_rx.try_recv() {
            match cluster.record_oom(&info.container, info.timestamp, info.memory) {
                Ok(true) => {
                    recorded += 1;
                    self.metrics.inc_oom_events_recorded();
                    self.logger.log_oom(
                        &info.container.pod_id,
                        &info.container.container_name,
                        info.memory.value(),
                    );
                }
                Ok(false) => debug!(container = %info.container, "Ignoring stale OOM event"),
                Err(e) => warn!(container = %info.container, error = %e, "Cannot record OOM event"),
            }
        }
        recorded
    }

    /// Restore aggregated history of every known policy object
    ///
    /// A checkpoint that cannot be loaded leaves its container with no
    /// history. Returns the number of checkpoints restored.
    pub async fn init_from_checkpoints(
        &self,
        cluster: &mut ClusterState,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        self.load_vpas(cluster).await?;

        let namespaces: BTreeSet<String> =
            cluster.vpas().map(|vpa| vpa.id.namespace.clone()).collect();
        let mut restored = 0;
        for namespace in namespaces {
            let checkpoints = match self.checkpoint_store.list(Some(&namespace)).await {
                Ok(checkpoints) => checkpoints,
                Err(e) => {
                    warn!(namespace = %namespace, error = %e, "Failed to list checkpoints");
                    continue;
                }
            };
            for checkpoint in checkpoints {
                let id = checkpoint.vpa_id();
                match cluster.set_vpa_checkpoint(&id, &checkpoint.container_name, &checkpoint.status, now)
                {
                    Ok(()) => restored += 1,
                    Err(e) => warn!(
                        vpa = %id,
                        checkpoint = %checkpoint.name,
                        error = %e,
                        "Skipping checkpoint"
                    ),
                }
            }
        }
        info!(restored = restored, "Restored checkpoints");
        Ok(restored)
    }

    /// Ingest historical usage of every pod the history source knows
    ///
    /// Returns the number of samples added.
    pub async fn init_from_history(
        &self,
        cluster: &mut ClusterState,
        history: &dyn HistorySource,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        self.load_vpas(cluster).await?;
        let pods = history.cluster_history().await?;

        let mut added = 0;
        for (pod_id, pod_history) in pods {
            if self.memory_saver_mode
                && !cluster.is_matched_by_any_vpa(&pod_id.namespace, &pod_history.last_labels)
            {
                continue;
            }
            cluster.add_or_update_pod(
                pod_id.clone(),
                &pod_history.last_labels,
                PodPhase::Running,
                now,
            );
            for (container_name, samples) in pod_history.samples {
                let container = ContainerId::new(pod_id.clone(), container_name);
                if let Err(e) = cluster.add_or_update_container(&container, Resources::new(), now) {
                    warn!(container = %container, error = %e, "Failed to add container");
                    continue;
                }
                for sample in samples {
                    let keyed = KeyedUsageSample {
                        container: container.clone(),
                        sample,
                    };
                    if let Ok(true) = cluster.add_sample(&keyed) {
                        added += 1;
                    }
                }
            }
        }
        info!(samples = added, "Loaded usage history");
        Ok(added)
    }

    /// Delete checkpoints whose policy object no longer exists
    ///
    /// Returns the number of checkpoints deleted.
    pub async fn gc_checkpoints(&self) -> Result<usize> {
        let live: HashSet<VpaId> = self
            .cluster_source
            .list_vpas()
            .await?
            .iter()
            .map(|o| o.id())
            .collect();

        let mut deleted = 0;
        for checkpoint in self.checkpoint_store.list(None).await? {
            if live.contains(&checkpoint.vpa_id()) {
                continue;
            }
            match self
                .checkpoint_store
                .delete(&checkpoint.namespace, &checkpoint.name)
                .await
            {
                Ok(()) => {
                    deleted += 1;
                    self.logger
                        .log_checkpoint_gc(&checkpoint.namespace, &checkpoint.name);
                }
                Err(e) => warn!(
                    checkpoint = %checkpoint.name,
                    error = %e,
                    "Failed to delete orphaned checkpoint"
                ),
            }
        }
        Ok(deleted)
    }
}

