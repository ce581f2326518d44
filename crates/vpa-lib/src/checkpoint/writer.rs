//! Periodic checkpoint writing
//!
//! Policy objects are visited oldest-checkpoint first so a time-boxed run
//! spreads writes fairly. A minimum number of writes per run is always
//! made, even once the deadline has passed.

use super::{CheckpointStore, VpaCheckpoint};
use crate::cluster::{ClusterState, ContainerNameToAggregateStateMap, SampleAggregator, Vpa};
use crate::error::ClusterStateError;
use crate::models::{ConditionType, ResourceKind, UsageSample, VpaId};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct CheckpointWriterConfig {
    /// Time budget of one writing run
    pub write_timeout: Duration,
    /// Writes made per run regardless of the budget
    pub min_checkpoints: usize,
}

impl Default for CheckpointWriterConfig {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(60),
            min_checkpoints: 10,
        }
    }
}

/// Outcome of one writing run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointRunStats {
    pub written: usize,
    pub failed: usize,
}

/// Saves aggregated history of every policy object to a `CheckpointStore`
pub struct CheckpointWriter {
    store: Arc<dyn CheckpointStore>,
    config: CheckpointWriterConfig,
}

impl CheckpointWriter {
    pub fn new(store: Arc<dyn CheckpointStore>, config: CheckpointWriterConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &CheckpointWriterConfig {
        &self.config
    }

    /// Write checkpoints within the configured time budget
    pub async fn store_checkpoints(
        &self,
        cluster: &mut ClusterState,
        now: DateTime<Utc>,
    ) -> CheckpointRunStats {
        let deadline = Instant::now() + self.config.write_timeout;
        self.store_checkpoints_until(cluster, now, deadline, self.config.min_checkpoints)
            .await
    }

    /// Write checkpoints until `deadline`, but at least `min_checkpoints` of them
    pub async fn store_checkpoints_until(
        &self,
        cluster: &mut ClusterState,
        now: DateTime<Utc>,
        deadline: Instant,
        min_checkpoints: usize,
    ) -> CheckpointRunStats {
        let mut order: Vec<(Option<DateTime<Utc>>, VpaId)> = cluster
            .vpas()
            .map(|vpa| (vpa.checkpoint_written, vpa.id.clone()))
            .collect();
        order.sort();

        let mut stats = CheckpointRunStats::default();
        let mut remaining_min = min_checkpoints;
        for (_, id) in order {
            if Instant::now() >= deadline && remaining_min == 0 {
                debug!(written = stats.written, "Checkpoint deadline reached");
                break;
            }
            let Some(vpa) = cluster.vpa(&id) else {
                continue;
            };
            if vpa.has_condition(ConditionType::FetchingHistory) {
                debug!(vpa = %id, "Skipping checkpoint while history is loading");
                continue;
            }

            let states = match aggregate_states_for_checkpoint(cluster, vpa, now) {
                Ok(states) => states,
                Err(e) => {
                    warn!(vpa = %id, error = %e, "Cannot build checkpoint state");
                    continue;
                }
            };
            for (container_name, state) in &states {
                let checkpoint = VpaCheckpoint::new(&id, container_name, state.save_to_checkpoint(now));
                match self.store.save(&checkpoint).await {
                    Ok(()) => stats.written += 1,
                    Err(e) => {
                        stats.failed += 1;
                        warn!(
                            vpa = %id,
                            container = %container_name,
                            error = %e,
                            "Failed to write checkpoint"
                        );
                    }
                }
                remaining_min = remaining_min.saturating_sub(1);
            }

            if let Some(vpa) = cluster.vpa_mut(&id) {
                vpa.checkpoint_written = Some(now);
            }
        }
        stats
    }
}

/// Per-container history of `vpa` without the peaks of open memory windows
///
/// A window still in progress may see a higher peak later; persisting its
/// provisional peak would leave two peaks for one window after a restore.
pub fn aggregate_states_for_checkpoint(
    cluster: &ClusterState,
    vpa: &Vpa,
    now: DateTime<Utc>,
) -> Result<ContainerNameToAggregateStateMap, ClusterStateError> {
    let mut states = cluster.aggregate_state_by_container_name(&vpa.id)?;
    for pod in cluster.pods() {
        for (container_name, container) in &pod.containers {
            if !vpa.uses_aggregation(container.aggregation_key()) {
                continue;
            }
            let (Some(state), Some(window_end)) =
                (states.get_mut(container_name), container.window_end())
            else {
                continue;
            };
            if now < window_end {
                state.subtract_sample(&UsageSample {
                    measure_start: window_end,
                    resource: ResourceKind::Memory,
                    usage: container.max_memory_peak(),
                    request: Default::default(),
                });
            }
        }
    }
    Ok(states)
}
