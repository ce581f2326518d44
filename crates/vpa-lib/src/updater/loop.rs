//! Updater run loop

use super::admission::{AdmitAll, PodEvictionAdmission};
use super::eviction::EvictionRestrictionFactory;
use super::priority::UpdatePriorityCalculator;
use super::UpdaterConfig;
use crate::health::{components, HealthRegistry};
use crate::models::{PodSnapshot, VpaId, VpaObject};
use crate::observability::{ControllerMetrics, StructuredLogger};
use crate::sources::{ClusterSource, EvictionClient, ReplicaCounter};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};

/// Outcome of one updater run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdaterRunStats {
    /// Policy objects allowed to evict
    pub vpas: usize,
    /// Live pods controlled by those objects
    pub controlled_pods: usize,
    pub evicted: usize,
    pub failed: usize,
}

/// Policy object controlling a pod
///
/// Among matching objects in the pod's namespace the oldest wins, ties
/// broken by name.
pub fn controlling_vpa<'a>(pod: &PodSnapshot, vpas: &'a [VpaObject]) -> Option<&'a VpaObject> {
    vpas.iter()
        .filter(|vpa| vpa.namespace == pod.namespace && vpa.selector.matches(&pod.labels))
        .min_by(|a, b| (a.created_at, &a.name).cmp(&(b.created_at, &b.name)))
}

/// Evicts pods so they pick up their recommendations
pub struct Updater {
    cluster_source: Arc<dyn ClusterSource>,
    restrictions: EvictionRestrictionFactory,
    admission: Box<dyn PodEvictionAdmission>,
    health: HealthRegistry,
    metrics: ControllerMetrics,
    logger: StructuredLogger,
    config: UpdaterConfig,
}

impl Updater {
    pub fn new(
        config: UpdaterConfig,
        cluster_source: Arc<dyn ClusterSource>,
        replica_counter: Arc<dyn ReplicaCounter>,
        eviction_client: Arc<dyn EvictionClient>,
        health: HealthRegistry,
    ) -> Self {
        let restrictions = EvictionRestrictionFactory::new(
            replica_counter,
            eviction_client,
            config.eviction.clone(),
        );
        Self {
            cluster_source,
            restrictions,
            admission: Box::new(AdmitAll),
            health,
            metrics: ControllerMetrics::new(),
            logger: StructuredLogger::new("updater"),
            config,
        }
    }

    pub fn with_admission(mut self, admission: Box<dyn PodEvictionAdmission>) -> Self {
        self.admission = admission;
        self
    }

    /// Run every step once at `now`
    ///
    /// Fails only when policy objects or pods cannot be listed.
    pub async fn run_once_at(&mut self, now: DateTime<Utc>) -> Result<UpdaterRunStats> {
        let mut stats = UpdaterRunStats::default();

        let vpas: Vec<VpaObject> = self
            .cluster_source
            .list_vpas()
            .await?
            .into_iter()
            .filter(|vpa| vpa.update_mode().allows_eviction())
            .collect();
        stats.vpas = vpas.len();
        if vpas.is_empty() {
            debug!("No policy objects allow eviction");
            return Ok(stats);
        }

        let live_pods: Vec<PodSnapshot> = self
            .cluster_source
            .list_pods()
            .await?
            .into_iter()
            .filter(|pod| pod.deletion_timestamp.is_none())
            .collect();

        let mut controlled: BTreeMap<VpaId, Vec<PodSnapshot>> = BTreeMap::new();
        for pod in &live_pods {
            if let Some(vpa) = controlling_vpa(pod, &vpas) {
                controlled.entry(vpa.id()).or_default().push(pod.clone());
            }
        }
        stats.controlled_pods = controlled.values().map(Vec::len).sum();

        self.admission.loop_init(&live_pods, &controlled);
        for vpa in &vpas {
            let id = vpa.id();
            let Some(pods) = controlled.get(&id) else {
                continue;
            };
            let Some(recommendation) = vpa
                .status
                .recommendation
                .as_ref()
                .filter(|r| !r.is_empty())
            else {
                debug!(vpa = %id, "No recommendation yet");
                continue;
            };

            let mut restriction = self.restrictions.new_restriction(pods).await;
            let mut calculator = UpdatePriorityCalculator::new(
                vpa.resource_policy.clone(),
                recommendation.clone(),
                self.config.priority.clone(),
            );
            for pod in pods.iter().filter(|pod| restriction.can_evict(pod)) {
                calculator.add_pod(pod, now);
            }

            for candidate in calculator.sorted_pods(self.admission.as_ref()) {
                if !restriction.can_evict(&candidate.pod) {
                    continue;
                }
                match restriction.evict(&candidate.pod).await {
                    Ok(()) => {
                        stats.evicted += 1;
                        self.metrics.inc_evictions();
                        self.logger.log_eviction(
                            &candidate.pod.id(),
                            &id,
                            candidate.priority.resource_diff,
                        );
                    }
                    Err(e) => {
                        stats.failed += 1;
                        self.metrics.inc_evictions_failed();
                        self.logger
                            .log_eviction_failure(&candidate.pod.id(), &id, &e.to_string());
                    }
                }
            }
        }
        self.admission.clean_up();
        Ok(stats)
    }

    /// Start the updater loop
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            min_replicas = self.config.eviction.min_replicas,
            tolerance = self.config.eviction.tolerance,
            "Starting updater loop"
        );

        let mut ticker = interval(self.config.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let start = Instant::now();
                    let outcome = self.run_once_at(Utc::now()).await;
                    let elapsed = start.elapsed();
                    self.metrics.observe_updater_latency(elapsed.as_secs_f64());

                    match outcome {
                        Ok(stats) => {
                            self.health.set_healthy(components::UPDATER).await;
                            debug!(
                                vpas = stats.vpas,
                                pods = stats.controlled_pods,
                                evicted = stats.evicted,
                                failed = stats.failed,
                                elapsed_ms = elapsed.as_millis(),
                                "Updater run complete"
                            );
                        }
                        Err(e) => {
                            warn!(error = %e, "Updater run skipped");
                            self.health
                                .set_degraded(components::UPDATER, e.to_string())
                                .await;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down updater loop");
                    break;
                }
            }
        }
    }
}
