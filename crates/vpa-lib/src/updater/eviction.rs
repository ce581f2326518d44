//! Eviction budgeting per replica group
//!
//! A restriction is rebuilt from the pod list on every updater run. Pods
//! are grouped by their owning controller, and each group may lose at
//! most `floor(configured × tolerance)` running replicas to evictions.

use crate::error::EvictionError;
use crate::models::{ControllerKind, ControllerRef, PodId, PodSnapshot};
use crate::sources::{EvictionClient, ReplicaCounter};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Eviction budget settings
#[derive(Debug, Clone)]
pub struct EvictionConfig {
    /// Groups with fewer live pods are never evicted from (default: 2)
    pub min_replicas: u32,
    /// Fraction of configured replicas that may be evicted at once (default: 0.5)
    pub tolerance: f64,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            min_replicas: 2,
            tolerance: 0.5,
        }
    }
}

/// Counters of one replica group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicaGroupStats {
    pub configured: u32,
    pub pending: u32,
    pub running: u32,
    pub evicted: u32,
    pub eviction_tolerance: u32,
}

impl ReplicaGroupStats {
    fn new(configured: u32, live_pods: &[&PodSnapshot], tolerance: f64) -> Self {
        let pending = live_pods.iter().filter(|p| p.is_pending()).count() as u32;
        Self {
            configured,
            pending,
            running: live_pods.len() as u32 - pending,
            evicted: 0,
            eviction_tolerance: (f64::from(configured) * tolerance).floor() as u32,
        }
    }

    fn allows_eviction(&self) -> bool {
        let alive = i64::from(self.running) - i64::from(self.evicted);
        let should_be_alive = i64::from(self.configured) - i64::from(self.eviction_tolerance);
        if alive > should_be_alive {
            return true;
        }
        // At least one eviction is always possible in a fully running group
        self.running == self.configured && self.eviction_tolerance == 0 && self.evicted == 0
    }
}

/// Builds a `PodsEvictionRestriction` for each set of pods
pub struct EvictionRestrictionFactory {
    replica_counter: Arc<dyn ReplicaCounter>,
    client: Arc<dyn EvictionClient>,
    config: EvictionConfig,
}

impl EvictionRestrictionFactory {
    pub fn new(
        replica_counter: Arc<dyn ReplicaCounter>,
        client: Arc<dyn EvictionClient>,
        config: EvictionConfig,
    ) -> Self {
        Self {
            replica_counter,
            client,
            config,
        }
    }

    /// Group `pods` by owner and look up each group's configured replicas
    ///
    /// Groups below `min_replicas`, and groups whose replica count cannot be
    /// read, get no budget.
    pub async fn new_restriction(&self, pods: &[PodSnapshot]) -> PodsEvictionRestriction {
        let mut by_owner: HashMap<&ControllerRef, Vec<&PodSnapshot>> = HashMap::new();
        for pod in pods {
            if let Some(owner) = &pod.owner {
                by_owner.entry(owner).or_default().push(pod);
            }
        }

        let mut restriction = PodsEvictionRestriction {
            pod_to_group: HashMap::new(),
            groups: HashMap::new(),
            client: self.client.clone(),
        };
        for (owner, live) in by_owner {
            if (live.len() as u32) < self.config.min_replicas {
                debug!(
                    owner = %owner,
                    live = live.len(),
                    min_replicas = self.config.min_replicas,
                    "Too few replicas to evict from"
                );
                continue;
            }

            let configured = if owner.kind == ControllerKind::Job {
                live.len() as u32
            } else {
                match self.replica_counter.configured_replicas(owner).await {
                    Ok(Some(replicas)) => replicas,
                    Ok(None) => {
                        debug!(owner = %owner, "Unknown controller, skipping group");
                        continue;
                    }
                    Err(e) => {
                        warn!(owner = %owner, error = %e, "Failed to read replica count");
                        continue;
                    }
                }
            };

            for pod in &live {
                restriction.pod_to_group.insert(pod.id(), owner.clone());
            }
            restriction.groups.insert(
                owner.clone(),
                ReplicaGroupStats::new(configured, &live, self.config.tolerance),
            );
        }
        restriction
    }
}

/// Per-run eviction budget of a set of pods
pub struct PodsEvictionRestriction {
    pod_to_group: HashMap<PodId, ControllerRef>,
    groups: HashMap<ControllerRef, ReplicaGroupStats>,
    client: Arc<dyn EvictionClient>,
}

impl PodsEvictionRestriction {
    pub fn group_stats(&self, owner: &ControllerRef) -> Option<&ReplicaGroupStats> {
        self.groups.get(owner)
    }

    /// Whether evicting `pod` stays within its group's budget
    ///
    /// Pending pods can always be evicted.
    pub fn can_evict(&self, pod: &PodSnapshot) -> bool {
        let Some(stats) = self
            .pod_to_group
            .get(&pod.id())
            .and_then(|owner| self.groups.get(owner))
        else {
            return false;
        };
        pod.is_pending() || stats.allows_eviction()
    }

    /// Evict `pod` if its group's budget allows it
    ///
    /// Only a successful eviction of a running pod is charged to the budget.
    pub async fn evict(&mut self, pod: &PodSnapshot) -> Result<(), EvictionError> {
        let id = pod.id();
        let owner = self
            .pod_to_group
            .get(&id)
            .cloned()
            .ok_or_else(|| EvictionError::NotReplicated(id.clone()))?;
        if !self.can_evict(pod) {
            return Err(EvictionError::BudgetExceeded(id));
        }

        self.client
            .evict(pod)
            .await
            .map_err(|e| EvictionError::ApiFailure {
                pod: id,
                message: format!("{:#}", e),
            })?;

        if !pod.is_pending() {
            let stats = self
                .groups
                .get_mut(&owner)
                .ok_or_else(|| EvictionError::MissingGroupStats(owner.to_string()))?;
            stats.evicted += 1;
        }
        Ok(())
    }
}
