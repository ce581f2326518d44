//! Recommender run loop

use super::feeder::{ClusterStateFeeder, SampleLoadStats};
use super::oom::OomInfo;
use super::{RecommenderConfig, RecommenderSources};
use crate::capping::apply_vpa_policy;
use crate::checkpoint::{CheckpointRunStats, CheckpointWriter};
use crate::cluster::ClusterState;
use crate::estimator::{container_name_to_aggregate_state_map, PodResourceRecommender};
use crate::health::{components, HealthRegistry};
use crate::models::{VpaId, VpaStatus};
use crate::observability::{ControllerMetrics, StructuredLogger};
use crate::sources::{HistorySource, StatusWriter};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};

/// Outcome of one recommender run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecommenderRunStats {
    pub samples: SampleLoadStats,
    pub ooms_recorded: usize,
    pub recommendations: usize,
    pub statuses_written: usize,
    pub checkpoints: CheckpointRunStats,
    /// Aggregates removed, if garbage collection ran
    pub aggregates_collected: Option<usize>,
    /// Orphaned checkpoints deleted, if checkpoint collection ran
    pub checkpoints_collected: Option<usize>,
}

/// Owns the cluster state and drives every recommender step
pub struct Recommender {
    cluster: ClusterState,
    feeder: ClusterStateFeeder,
    recommender: PodResourceRecommender,
    checkpoint_writer: CheckpointWriter,
    status_writer: Arc<dyn StatusWriter>,
    /// Last status written per policy object
    written_statuses: HashMap<VpaId, VpaStatus>,
    last_checkpoint_gc: Option<DateTime<Utc>>,
    health: HealthRegistry,
    metrics: ControllerMetrics,
    logger: StructuredLogger,
    config: RecommenderConfig,
}

impl Recommender {
    pub fn new(
        config: RecommenderConfig,
        sources: RecommenderSources,
        oom_rx: mpsc::Receiver<OomInfo>,
        health: HealthRegistry,
    ) -> Self {
        let gc_interval = chrono::Duration::from_std(config.aggregate_gc_interval)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let feeder = ClusterStateFeeder::new(
            sources.cluster,
            sources.metrics,
            sources.checkpoints.clone(),
            oom_rx,
            config.memory_saver_mode,
        );

        Self {
            cluster: ClusterState::new(config.aggregations, gc_interval),
            feeder,
            recommender: PodResourceRecommender::new(&config.estimator),
            checkpoint_writer: CheckpointWriter::new(
                sources.checkpoints,
                config.checkpoint_writer.clone(),
            ),
            status_writer: sources.status,
            written_statuses: HashMap::new(),
            last_checkpoint_gc: None,
            health,
            metrics: ControllerMetrics::new(),
            logger: StructuredLogger::new("recommender"),
            config,
        }
    }

    pub fn cluster_state(&self) -> &ClusterState {
        &self.cluster
    }

    /// Restore history from checkpoints and mark the controller ready
    ///
    /// A failure here leaves the recommender on a cold start.
    pub async fn init(&mut self, now: DateTime<Utc>) {
        match self.feeder.init_from_checkpoints(&mut self.cluster, now).await {
            Ok(_) => self.health.set_healthy(components::CHECKPOINT_STORE).await,
            Err(e) => {
                warn!(error = %e, "Failed to restore checkpoints, starting without history");
                self.health
                    .set_degraded(components::CHECKPOINT_STORE, e.to_string())
                    .await;
            }
        }
        self.health.set_ready(true).await;
    }

    /// Ingest usage history once before the first run
    pub async fn init_from_history(&mut self, history: &dyn HistorySource, now: DateTime<Utc>) {
        if let Err(e) = self
            .feeder
            .init_from_history(&mut self.cluster, history, now)
            .await
        {
            warn!(error = %e, "Failed to load usage history");
        }
    }

    /// Recompute and store the recommendation of every policy object
    ///
    /// Returns the number of recommendations computed and statuses written.
    pub async fn update_vpas(&mut self, now: DateTime<Utc>) -> (usize, usize) {
        let ids: Vec<VpaId> = self.cluster.vpas().map(|vpa| vpa.id.clone()).collect();
        let mut computed = 0;
        let mut written = 0;

        for id in ids {
            let Some(vpa) = self.cluster.vpa(&id) else {
                continue;
            };
            let states = match container_name_to_aggregate_state_map(vpa, self.cluster.aggregates())
            {
                Ok(states) => states,
                Err(e) => {
                    warn!(vpa = %id, error = %e, "Cannot aggregate container states");
                    continue;
                }
            };
            let recommendation =
                apply_vpa_policy(&self.recommender.recommend(&states), vpa.resource_policy());
            let changed = vpa.recommendation.as_ref() != Some(&recommendation);

            if let Err(e) = self
                .cluster
                .update_recommendation(&id, recommendation.clone())
            {
                warn!(vpa = %id, error = %e, "Cannot store recommendation");
                continue;
            }
            computed += 1;
            self.metrics.inc_recommendations_computed();
            if changed {
                self.logger.log_recommendation(&id, &recommendation);
            }

            let Some(vpa) = self.cluster.vpa_mut(&id) else {
                continue;
            };
            let pods_matched = vpa.has_matched_pods();
            vpa.update_conditions(pods_matched, now);
            let status = vpa.as_status();
            if self.write_status(&id, status).await {
                written += 1;
            }
        }
        (computed, written)
    }

    /// Write a status unless the store or the last write already has it
    async fn write_status(&mut self, id: &VpaId, status: VpaStatus) -> bool {
        let observed = self
            .cluster
            .observed_vpas
            .iter()
            .find(|object| &object.id() == id)
            .map(|object| &object.status);
        if observed == Some(&status) || self.written_statuses.get(id) == Some(&status) {
            return false;
        }

        match self.status_writer.write_status(id, &status).await {
            Ok(()) => {
                self.written_statuses.insert(id.clone(), status);
                true
            }
            Err(e) => {
                warn!(vpa = %id, error = %e, "Failed to write status");
                false
            }
        }
    }

    fn checkpoint_gc_due(&self, now: DateTime<Utc>) -> bool {
        let interval = chrono::Duration::from_std(self.config.checkpoint_gc_interval)
            .unwrap_or_else(|_| chrono::Duration::minutes(10));
        self.last_checkpoint_gc
            .map_or(true, |last| now - last >= interval)
    }

    /// Run every step once at `now`
    pub async fn run_once_at(&mut self, now: DateTime<Utc>) -> RecommenderRunStats {
        let mut stats = RecommenderRunStats::default();

        let listed = match self.feeder.load_vpas(&mut self.cluster).await {
            Ok(()) => self.feeder.load_pods(&mut self.cluster, now).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &listed {
            warn!(error = %e, "Listing failed, keeping previous cluster state");
        }
        self.health
            .report(components::CLUSTER_SOURCE, listed.map_err(|e| e.to_string()))
            .await;

        match self.feeder.load_realtime_metrics(&mut self.cluster).await {
            Ok(samples) => stats.samples = samples,
            Err(e) => warn!(error = %e, "Failed to load realtime metrics"),
        }
        stats.ooms_recorded = self.feeder.drain_oom(&mut self.cluster);

        let (computed, written) = self.update_vpas(now).await;
        stats.recommendations = computed;
        stats.statuses_written = written;

        stats.checkpoints = self
            .checkpoint_writer
            .store_checkpoints(&mut self.cluster, now)
            .await;
        self.metrics.add_checkpoints_written(stats.checkpoints.written);
        if stats.checkpoints.written > 0 || stats.checkpoints.failed > 0 {
            self.logger
                .log_checkpoints_written(stats.checkpoints.written, stats.checkpoints.failed);
        }

        stats.aggregates_collected = self.cluster.rate_limited_garbage_collect(now);
        if let Some(removed) = stats.aggregates_collected {
            self.logger
                .log_aggregate_gc(removed, self.cluster.aggregates().len());
        }

        let mut store_outcome: Result<(), String> = if stats.checkpoints.failed > 0 {
            Err(format!("{} checkpoint writes failed", stats.checkpoints.failed))
        } else {
            Ok(())
        };
        if self.checkpoint_gc_due(now) {
            match self.feeder.gc_checkpoints().await {
                Ok(deleted) => {
                    stats.checkpoints_collected = Some(deleted);
                    self.last_checkpoint_gc = Some(now);
                }
                Err(e) => {
                    warn!(error = %e, "Checkpoint garbage collection failed");
                    store_outcome = Err(e.to_string());
                }
            }
        }
        self.health
            .report(components::CHECKPOINT_STORE, store_outcome)
            .await;

        self.metrics.set_cluster_state_size(
            self.cluster.aggregates().len(),
            self.cluster.vpa_count(),
            self.cluster.pod_count(),
        );
        stats
    }

    /// Start the recommender loop
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            memory_saver = self.config.memory_saver_mode,
            "Starting recommender loop"
        );

        let mut ticker = interval(self.config.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let start = Instant::now();
                    let stats = self.run_once_at(Utc::now()).await;
                    let elapsed = start.elapsed();

                    self.metrics.observe_recommender_latency(elapsed.as_secs_f64());
                    self.health.set_healthy(components::RECOMMENDER).await;
                    debug!(
                        recommendations = stats.recommendations,
                        samples = stats.samples.added,
                        checkpoints = stats.checkpoints.written,
                        elapsed_ms = elapsed.as_millis(),
                        "Recommender run complete"
                    );
                }
                _ = shutdown.recv() => {
                    info!("Shutting down recommender loop");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointStore, MemoryCheckpointStore, VpaCheckpoint};
    use crate::cluster::{AggregateContainerState, AggregationsConfig, LabelSelector};
    use crate::health::ComponentStatus;
    use crate::models::{
        ConditionType, ContainerId, ContainerMetricsSnapshot, ContainerSpec, PodId, PodPhase,
        PodSnapshot, ResourceAmount, ResourceKind, Resources, VpaObject,
    };
    use crate::sources::{ClusterSnapshot, MemoryStatusWriter, SnapshotSource};
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn resources(cpu: i64, memory: i64) -> Resources {
        [
            (ResourceKind::Cpu, ResourceAmount(cpu)),
            (ResourceKind::Memory, ResourceAmount(memory)),
        ]
        .into_iter()
        .collect()
    }

    fn vpa_object(name: &str) -> VpaObject {
        VpaObject {
            namespace: "ns".to_string(),
            name: name.to_string(),
            created_at: t0() - ChronoDuration::days(1),
            selector: LabelSelector::from_labels(&[("app", "web")]),
            update_mode: None,
            resource_policy: None,
            status: VpaStatus::default(),
        }
    }

    fn snapshot(at: DateTime<Utc>) -> ClusterSnapshot {
        let pod = PodSnapshot {
            namespace: "ns".to_string(),
            name: "web-1".to_string(),
            labels: [("app".to_string(), "web".to_string())].into_iter().collect(),
            phase: PodPhase::Running,
            owner: None,
            start_time: Some(at - ChronoDuration::hours(1)),
            deletion_timestamp: None,
            containers: vec![ContainerSpec {
                name: "app".to_string(),
                requests: resources(200, 100 << 20),
                limits: Resources::new(),
            }],
            container_statuses: Vec::new(),
        };
        ClusterSnapshot {
            vpas: vec![vpa_object("web")],
            metrics: vec![ContainerMetricsSnapshot {
                container: ContainerId::new(pod.id(), "app"),
                snapshot_time: at,
                usage: resources(500, 200_000_000),
            }],
            pods: vec![pod],
            ..Default::default()
        }
    }

    struct Fixture {
        source: Arc<SnapshotSource>,
        store: Arc<MemoryCheckpointStore>,
        status: Arc<MemoryStatusWriter>,
        oom_tx: mpsc::Sender<OomInfo>,
        health: HealthRegistry,
    }

    impl Fixture {
        fn new(snapshot: ClusterSnapshot) -> (Self, Recommender) {
            let source = Arc::new(SnapshotSource::in_memory(snapshot));
            let store = Arc::new(MemoryCheckpointStore::new());
            let status = Arc::new(MemoryStatusWriter::new());
            let (oom_tx, oom_rx) = mpsc::channel(16);
            let health = HealthRegistry::new();
            let recommender = Recommender::new(
                RecommenderConfig::default(),
                RecommenderSources {
                    cluster: source.clone(),
                    metrics: source.clone(),
                    checkpoints: store.clone(),
                    status: status.clone(),
                },
                oom_rx,
                health.clone(),
            );
            let fixture = Self {
                source,
                store,
                status,
                oom_tx,
                health,
            };
            (fixture, recommender)
        }
    }

    #[tokio::test]
    async fn test_run_once_produces_recommendation() {
        let (fixture, mut recommender) = Fixture::new(snapshot(t0()));
        let stats = recommender.run_once_at(t0()).await;

        assert_eq!(stats.samples.added, 2);
        assert_eq!(stats.recommendations, 1);
        assert_eq!(stats.statuses_written, 1);
        assert_eq!(stats.checkpoints.written, 1);
        assert_eq!(stats.checkpoints_collected, Some(0));

        let id = VpaId::new("ns", "web");
        let status = fixture.status.get(&id).unwrap();
        let recommendation = status.recommendation.as_ref().unwrap();
        assert_eq!(recommendation.container_recommendations.len(), 1);
        assert_eq!(recommendation.container_recommendations[0].container_name, "app");
        assert!(status
            .condition(ConditionType::RecommendationProvided)
            .unwrap()
            .status);
        assert!(fixture.store.get("ns", "web-app").is_some());
    }

    #[tokio::test]
    async fn test_unchanged_status_not_rewritten() {
        let (fixture, mut recommender) = Fixture::new(snapshot(t0()));
        recommender.run_once_at(t0()).await;
        let stats = recommender.run_once_at(t0()).await;

        assert_eq!(stats.statuses_written, 0);
        assert_eq!(fixture.status.writes(), 1);
    }

    #[tokio::test]
    async fn test_removed_objects_are_forgotten_and_checkpoints_collected() {
        let (fixture, mut recommender) = Fixture::new(snapshot(t0()));
        recommender.run_once_at(t0()).await;
        assert_eq!(recommender.cluster_state().vpa_count(), 1);

        fixture.source.replace(ClusterSnapshot::default()).await;
        let later = t0() + ChronoDuration::minutes(11);
        let stats = recommender.run_once_at(later).await;

        assert_eq!(recommender.cluster_state().vpa_count(), 0);
        assert_eq!(recommender.cluster_state().pod_count(), 0);
        assert_eq!(stats.checkpoints_collected, Some(1));
        assert!(fixture.store.is_empty());
    }

    #[tokio::test]
    async fn test_checkpoint_gc_is_rate_limited() {
        let (_fixture, mut recommender) = Fixture::new(snapshot(t0()));
        recommender.run_once_at(t0()).await;
        let stats = recommender
            .run_once_at(t0() + ChronoDuration::minutes(1))
            .await;
        assert_eq!(stats.checkpoints_collected, None);
    }

    #[tokio::test]
    async fn test_init_restores_checkpoints() {
        let (fixture, mut recommender) = Fixture::new(snapshot(t0()));
        let state = AggregateContainerState::new(&AggregationsConfig::default(), t0());
        let id = VpaId::new("ns", "web");
        fixture
            .store
            .save(&VpaCheckpoint::new(&id, "app", state.save_to_checkpoint(t0())))
            .await
            .unwrap();
        fixture
            .store
            .save(&VpaCheckpoint::new(
                &VpaId::new("ns", "gone"),
                "app",
                state.save_to_checkpoint(t0()),
            ))
            .await
            .unwrap();

        recommender.init(t0()).await;

        let vpa = recommender.cluster_state().vpa(&id).unwrap();
        assert!(vpa.containers_initial_aggregate_state.contains_key("app"));
        assert!(fixture.health.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_listing_failure_keeps_state() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cluster.json");
        std::fs::write(&path, serde_json::to_vec(&snapshot(t0())).unwrap()).unwrap();

        let source = Arc::new(SnapshotSource::from_file(&path));
        let (_oom_tx, oom_rx) = mpsc::channel(16);
        let health = HealthRegistry::new();
        let mut recommender = Recommender::new(
            RecommenderConfig::default(),
            RecommenderSources {
                cluster: source.clone(),
                metrics: source,
                checkpoints: Arc::new(MemoryCheckpointStore::new()),
                status: Arc::new(MemoryStatusWriter::new()),
            },
            oom_rx,
            health.clone(),
        );
        recommender.run_once_at(t0()).await;

        std::fs::remove_file(&path).unwrap();
        recommender
            .run_once_at(t0() + ChronoDuration::minutes(1))
            .await;

        assert_eq!(recommender.cluster_state().vpa_count(), 1);
        assert_eq!(recommender.cluster_state().pod_count(), 1);
        let health = health.health().await;
        assert_eq!(
            health.components[components::CLUSTER_SOURCE].status,
            ComponentStatus::Degraded
        );
    }

    #[tokio::test]
    async fn test_queued_oom_is_recorded() {
        let (fixture, mut recommender) = Fixture::new(snapshot(t0()));
        recommender.run_once_at(t0()).await;

        fixture
            .oom_tx
            .send(OomInfo {
                container: ContainerId::new(PodId::new("ns", "web-1"), "app"),
                timestamp: t0() + ChronoDuration::minutes(1),
                memory: ResourceAmount(100 << 20),
            })
            .await
            .unwrap();
        let stats = recommender
            .run_once_at(t0() + ChronoDuration::minutes(2))
            .await;
        assert_eq!(stats.ooms_recorded, 1);
    }
}
