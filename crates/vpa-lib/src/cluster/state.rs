//! Cluster-wide model of pods, policy objects and aggregated usage
//!
//! Owned and mutated by a single control loop. Background producers talk
//! to it through channels only, so there is no locking here.

use super::aggregate::{
    AggregateContainerState, AggregateStateCheckpoint, AggregationKey, AggregationsConfig,
};
use super::container::ContainerState;
use super::labels::{LabelSetId, LabelSetInterner};
use super::vpa::{AggregateStateMap, ContainerNameToAggregateStateMap, Vpa};
use crate::error::{CheckpointError, ClusterStateError};
use crate::models::{
    ConditionType, ContainerId, KeyedUsageSample, Labels, PodId, PodPhase,
    RecommendedPodResources, ResourceAmount, Resources, VpaId, VpaObject,
};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// Pod as tracked by the cluster state
#[derive(Debug, Clone)]
pub struct PodState {
    pub id: PodId,
    labels: LabelSetId,
    pub phase: PodPhase,
    pub containers: BTreeMap<String, ContainerState>,
}

impl PodState {
    fn new(id: PodId, labels: LabelSetId) -> Self {
        Self {
            id,
            labels,
            phase: PodPhase::Running,
            containers: BTreeMap::new(),
        }
    }

    pub fn label_set(&self) -> LabelSetId {
        self.labels
    }
}

/// Single source of truth for usage history grouped by stable identity
#[derive(Debug)]
pub struct ClusterState {
    pods: HashMap<PodId, PodState>,
    vpas: BTreeMap<VpaId, Vpa>,
    aggregates: AggregateStateMap,
    label_sets: LabelSetInterner,
    /// Policy objects as last listed from the store
    pub observed_vpas: Vec<VpaObject>,
    last_aggregate_gc: Option<DateTime<Utc>>,
    gc_interval: Duration,
    config: AggregationsConfig,
}

impl ClusterState {
    pub fn new(config: AggregationsConfig, gc_interval: Duration) -> Self {
        Self {
            pods: HashMap::new(),
            vpas: BTreeMap::new(),
            aggregates: AggregateStateMap::new(),
            label_sets: LabelSetInterner::new(),
            observed_vpas: Vec::new(),
            last_aggregate_gc: None,
            gc_interval,
            config,
        }
    }

    pub fn config(&self) -> &AggregationsConfig {
        &self.config
    }

    pub fn pods(&self) -> impl Iterator<Item = &PodState> {
        self.pods.values()
    }

    pub fn pod(&self, id: &PodId) -> Option<&PodState> {
        self.pods.get(id)
    }

    pub fn pod_count(&self) -> usize {
        self.pods.len()
    }

    pub fn pod_labels(&self, pod: &PodState) -> &Labels {
        self.label_sets.get(pod.labels)
    }

    pub fn vpas(&self) -> impl Iterator<Item = &Vpa> {
        self.vpas.values()
    }

    pub fn vpa(&self, id: &VpaId) -> Option<&Vpa> {
        self.vpas.get(id)
    }

    pub fn vpa_mut(&mut self, id: &VpaId) -> Option<&mut Vpa> {
        self.vpas.get_mut(id)
    }

    pub fn vpa_count(&self) -> usize {
        self.vpas.len()
    }

    pub fn aggregates(&self) -> &AggregateStateMap {
        &self.aggregates
    }

    pub fn labels(&self, id: LabelSetId) -> &Labels {
        self.label_sets.get(id)
    }

    /// Aggregation key of a container of `pod`
    pub fn aggregation_key(&self, pod: &PodState, container_name: &str) -> AggregationKey {
        AggregationKey::new(pod.id.namespace.clone(), container_name, pod.labels)
    }

    /// True if any policy object selects a pod with these labels
    pub fn is_matched_by_any_vpa(&self, namespace: &str, labels: &Labels) -> bool {
        self.vpas.values().any(|vpa| vpa.matches_pod(namespace, labels))
    }

    /// Add a pod or update its labels and phase
    ///
    /// A label change relinks every container of the pod to the aggregate
    /// of its new key. History already aggregated stays where it is.
    pub fn add_or_update_pod(
        &mut self,
        id: PodId,
        labels: &Labels,
        phase: PodPhase,
        now: DateTime<Utc>,
    ) {
        let new_labels = self.label_sets.intern(labels);
        let old_labels = self.pods.get(&id).map(|pod| pod.labels);

        if old_labels != Some(new_labels) {
            if let Some(old) = old_labels {
                self.update_vpa_pod_counts(&id.namespace, old, false);
            }
            let pod = self
                .pods
                .entry(id.clone())
                .or_insert_with(|| PodState::new(id.clone(), new_labels));
            pod.labels = new_labels;

            let container_names: Vec<String> = pod.containers.keys().cloned().collect();
            for name in container_names {
                let key = AggregationKey::new(id.namespace.clone(), name.clone(), new_labels);
                self.find_or_create_aggregate(&key, now);
                if let Some(container) = self
                    .pods
                    .get_mut(&id)
                    .and_then(|pod| pod.containers.get_mut(&name))
                {
                    container.set_aggregation_key(key);
                }
            }
            self.update_vpa_pod_counts(&id.namespace, new_labels, true);
        }

        if let Some(pod) = self.pods.get_mut(&id) {
            pod.phase = phase;
        }
    }

    pub fn delete_pod(&mut self, id: &PodId) {
        if let Some(pod) = self.pods.remove(id) {
            self.update_vpa_pod_counts(&id.namespace, pod.labels, false);
        }
    }

    fn update_vpa_pod_counts(&mut self, namespace: &str, labels: LabelSetId, added: bool) {
        let labels = self.label_sets.get(labels);
        for vpa in self.vpas.values_mut() {
            if vpa.matches_pod(namespace, labels) {
                vpa.pod_count = if added {
                    vpa.pod_count + 1
                } else {
                    vpa.pod_count.saturating_sub(1)
                };
            }
        }
    }

    /// Add a container to a known pod, or update its request
    pub fn add_or_update_container(
        &mut self,
        id: &ContainerId,
        request: Resources,
        now: DateTime<Utc>,
    ) -> Result<(), ClusterStateError> {
        let pod = self
            .pods
            .get(&id.pod_id)
            .ok_or_else(|| ClusterStateError::PodNotFound(id.pod_id.clone()))?;
        let key = self.aggregation_key(pod, &id.container_name);
        self.find_or_create_aggregate(&key, now);

        let pod = self
            .pods
            .get_mut(&id.pod_id)
            .ok_or_else(|| ClusterStateError::PodNotFound(id.pod_id.clone()))?;
        match pod.containers.get_mut(&id.container_name) {
            Some(container) => container.request = request,
            None => {
                pod.containers.insert(
                    id.container_name.clone(),
                    ContainerState::new(request, key),
                );
            }
        }
        Ok(())
    }

    pub fn container(&self, id: &ContainerId) -> Result<&ContainerState, ClusterStateError> {
        let pod = self
            .pods
            .get(&id.pod_id)
            .ok_or_else(|| ClusterStateError::PodNotFound(id.pod_id.clone()))?;
        pod.containers
            .get(&id.container_name)
            .ok_or_else(|| ClusterStateError::ContainerNotFound(id.clone()))
    }

    /// Container and the aggregate its key currently resolves to
    ///
    /// The aggregate is recreated at `at` if garbage collection removed it.
    fn resolve(
        &mut self,
        id: &ContainerId,
        at: DateTime<Utc>,
    ) -> Result<(&mut ContainerState, &mut AggregateContainerState), ClusterStateError> {
        let key = self.container(id)?.aggregation_key().clone();
        self.find_or_create_aggregate(&key, at);
        let container = self
            .pods
            .get_mut(&id.pod_id)
            .and_then(|pod| pod.containers.get_mut(&id.container_name))
            .ok_or_else(|| ClusterStateError::ContainerNotFound(id.clone()))?;
        let aggregate = self
            .aggregates
            .get_mut(&key)
            .ok_or_else(|| ClusterStateError::ContainerNotFound(id.clone()))?;
        Ok((container, aggregate))
    }

    /// Route a usage sample to its container's aggregate
    ///
    /// Returns `Ok(false)` if the sample was rejected as invalid or stale.
    pub fn add_sample(&mut self, sample: &KeyedUsageSample) -> Result<bool, ClusterStateError> {
        let config = self.config;
        let (container, aggregate) = self.resolve(&sample.container, sample.sample.measure_start)?;
        Ok(container.add_sample(&sample.sample, aggregate, &config))
    }

    /// Record an OOM kill. Returns `Ok(false)` if the event is too old.
    pub fn record_oom(
        &mut self,
        id: &ContainerId,
        timestamp: DateTime<Utc>,
        requested_memory: ResourceAmount,
    ) -> Result<bool, ClusterStateError> {
        let config = self.config;
        let (container, aggregate) = self.resolve(id, timestamp)?;
        Ok(container.record_oom(timestamp, requested_memory, aggregate, &config))
    }

    /// Add or update a policy object
    ///
    /// A changed selector recreates the in-memory object and re-matches it
    /// against every existing aggregation key.
    pub fn add_or_update_vpa(&mut self, object: &VpaObject) -> Result<(), ClusterStateError> {
        let id = object.id();
        let selector_changed = self
            .vpas
            .get(&id)
            .map_or(false, |vpa| vpa.pod_selector != object.selector);
        if selector_changed {
            debug!(vpa = %id, "Selector changed, relinking aggregates");
            self.delete_vpa(&id)?;
        }

        if !self.vpas.contains_key(&id) {
            let mut vpa = Vpa::new(id.clone(), object.selector.clone(), object.created_at);
            for (key, aggregate) in self.aggregates.iter_mut() {
                vpa.use_aggregation_if_matching(key, self.label_sets.get(key.labels), aggregate);
            }
            vpa.pod_count = self.matching_pods(&vpa).len();
            self.vpas.insert(id.clone(), vpa);
        }

        let vpa = self
            .vpas
            .get_mut(&id)
            .ok_or_else(|| ClusterStateError::VpaNotFound(id.clone()))?;
        vpa.conditions = object
            .status
            .conditions
            .iter()
            .map(|c| (c.condition_type, c.clone()))
            .collect();
        vpa.recommendation = if vpa.has_condition(ConditionType::RecommendationProvided) {
            object.status.recommendation.clone()
        } else {
            None
        };
        vpa.set_update_mode(object.update_mode, &mut self.aggregates);
        vpa.set_resource_policy(object.resource_policy.clone(), &mut self.aggregates);
        Ok(())
    }

    /// Remove a policy object; its aggregates are no longer autoscaled
    pub fn delete_vpa(&mut self, id: &VpaId) -> Result<(), ClusterStateError> {
        let vpa = self
            .vpas
            .remove(id)
            .ok_or_else(|| ClusterStateError::VpaNotFound(id.clone()))?;
        for key in vpa.aggregate_keys() {
            if let Some(aggregate) = self.aggregates.get_mut(key) {
                aggregate.mark_not_autoscaled();
            }
        }
        Ok(())
    }

    /// Pods selected by a policy object
    pub fn matching_pods(&self, vpa: &Vpa) -> Vec<PodId> {
        self.pods
            .values()
            .filter(|pod| vpa.matches_pod(&pod.id.namespace, self.label_sets.get(pod.labels)))
            .map(|pod| pod.id.clone())
            .collect()
    }

    fn find_or_create_aggregate(&mut self, key: &AggregationKey, now: DateTime<Utc>) {
        if self.aggregates.contains_key(key) {
            return;
        }
        let mut aggregate = AggregateContainerState::new(&self.config, now);
        let labels = self.label_sets.get(key.labels);
        for vpa in self.vpas.values_mut() {
            vpa.use_aggregation_if_matching(key, labels, &mut aggregate);
        }
        self.aggregates.insert(key.clone(), aggregate);
    }

    /// Store a computed recommendation on a policy object
    pub fn update_recommendation(
        &mut self,
        id: &VpaId,
        recommendation: RecommendedPodResources,
    ) -> Result<(), ClusterStateError> {
        let vpa = self
            .vpas
            .get_mut(id)
            .ok_or_else(|| ClusterStateError::VpaNotFound(id.clone()))?;
        vpa.update_recommendation(recommendation, &mut self.aggregates);
        Ok(())
    }

    /// Per-container view of a policy object's history
    pub fn aggregate_state_by_container_name(
        &self,
        id: &VpaId,
    ) -> Result<ContainerNameToAggregateStateMap, ClusterStateError> {
        let vpa = self
            .vpas
            .get(id)
            .ok_or_else(|| ClusterStateError::VpaNotFound(id.clone()))?;
        Ok(vpa.aggregate_state_by_container_name(&self.aggregates)?)
    }

    /// Restore a container's history from a checkpoint into its policy object
    pub fn set_vpa_checkpoint(
        &mut self,
        id: &VpaId,
        container_name: &str,
        checkpoint: &AggregateStateCheckpoint,
        now: DateTime<Utc>,
    ) -> Result<(), CheckpointError> {
        let mut state = AggregateContainerState::new(&self.config, now);
        let vpa = self
            .vpas
            .get_mut(id)
            .ok_or_else(|| CheckpointError::VpaNotFound(id.clone()))?;
        state.load_from_checkpoint(checkpoint)?;
        vpa.containers_initial_aggregate_state
            .insert(container_name.to_string(), state);
        Ok(())
    }

    /// Keys of containers belonging to pods that may still run
    fn active_aggregation_keys(&self) -> HashSet<AggregationKey> {
        self.pods
            .values()
            .filter(|pod| !pod.phase.is_terminal())
            .flat_map(|pod| pod.containers.values())
            .map(|container| container.aggregation_key().clone())
            .collect()
    }

    /// Drop expired aggregates that no live container uses
    ///
    /// Returns the number of aggregates removed.
    pub fn garbage_collect(&mut self, now: DateTime<Utc>) -> usize {
        let active = self.active_aggregation_keys();
        let window = self.config.aggregation_window_length();
        let expired: Vec<AggregationKey> = self
            .aggregates
            .iter()
            .filter(|(key, aggregate)| {
                !active.contains(*key) && aggregate.is_expired(now, window)
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            debug!(key = %key, "Removing expired aggregate");
            self.aggregates.remove(key);
            for vpa in self.vpas.values_mut() {
                vpa.delete_aggregation(key);
            }
        }
        self.last_aggregate_gc = Some(now);
        expired.len()
    }

    /// Run garbage collection at most once per configured interval
    pub fn rate_limited_garbage_collect(&mut self, now: DateTime<Utc>) -> Option<usize> {
        if let Some(last) = self.last_aggregate_gc {
            if now - last < self.gc_interval {
                return None;
            }
        }
        Some(self.garbage_collect(now))
    }
}
