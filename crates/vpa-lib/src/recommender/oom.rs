//! OOM kill detection
//!
//! Compares successive pod listings and reports containers that were
//! restarted after being OOM-killed. Events reach the recommender through
//! a bounded channel which the control loop drains without blocking.

use crate::models::{ContainerId, PodId, PodSnapshot, ResourceAmount, ResourceKind};
use crate::observability::ControllerMetrics;
use crate::sources::ClusterSource;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Default capacity of the OOM event channel
pub const DEFAULT_OOM_CHANNEL_CAPACITY: usize = 5000;

/// One observed OOM kill
#[derive(Debug, Clone, PartialEq)]
pub struct OomInfo {
    pub container: ContainerId,
    /// When the killed container terminated
    pub timestamp: DateTime<Utc>,
    /// Memory request of the container at the time of the kill
    pub memory: ResourceAmount,
}

/// Watches pod listings for OOM-killed containers
pub struct OomObserver {
    tx: mpsc::Sender<OomInfo>,
    restart_counts: HashMap<PodId, HashMap<String, u32>>,
    metrics: ControllerMetrics,
}

impl OomObserver {
    /// Create an observer and the receiving end of its event channel
    pub fn new(capacity: usize, metrics: ControllerMetrics) -> (Self, mpsc::Receiver<OomInfo>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let observer = Self {
            tx,
            restart_counts: HashMap::new(),
            metrics,
        };
        (observer, rx)
    }

    /// Compare a pod listing with the previous one
    ///
    /// The first sighting of a pod only records its restart counts. Returns
    /// the number of events queued.
    pub fn observe(&mut self, pods: &[PodSnapshot]) -> usize {
        let mut sent = 0;
        let mut seen = HashMap::with_capacity(pods.len());

        for pod in pods {
            let id = pod.id();
            let previous = self.restart_counts.remove(&id);
            let mut counts = HashMap::with_capacity(pod.container_statuses.len());

            for status in &pod.container_statuses {
                counts.insert(status.name.clone(), status.restart_count);

                let restarted = previous
                    .as_ref()
                    .and_then(|p| p.get(&status.name))
                    .map_or(false, |&before| status.restart_count > before);
                if !restarted {
                    continue;
                }
                let Some(termination) = status.last_termination.as_ref() else {
                    continue;
                };
                if !termination.is_oom_kill() {
                    continue;
                }

                let memory = pod
                    .container(&status.name)
                    .and_then(|c| c.requests.get(&ResourceKind::Memory).copied())
                    .unwrap_or_default();
                let info = OomInfo {
                    container: ContainerId::new(id.clone(), status.name.clone()),
                    timestamp: termination.finished_at,
                    memory,
                };
                if self.send(info) {
                    sent += 1;
                }
            }
            seen.insert(id, counts);
        }

        // Pods missing from this listing are forgotten
        self.restart_counts = seen;
        sent
    }

    fn send(&self, info: OomInfo) -> bool {
        match self.tx.try_send(info) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(info)) => {
                self.metrics.inc_oom_events_dropped();
                warn!(container = %info.container, "OOM channel full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("OOM channel closed");
                false
            }
        }
    }

    /// Poll the cluster source until shutdown
    pub async fn run(
        mut self,
        source: Arc<dyn ClusterSource>,
        poll_interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(
            interval_secs = poll_interval.as_secs(),
            "Starting OOM observer"
        );
        let mut ticker = interval(poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match source.list_pods().await {
                        Ok(pods) => {
                            let sent = self.observe(&pods);
                            if sent > 0 {
                                debug!(events = sent, "Queued OOM events");
                            }
                        }
                        Err(e) => warn!(error = %e, "Failed to list pods for OOM detection"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down OOM observer");
                    break;
                }
            }
        }
    }
}
