//! In-memory view of a policy object
//!
//! A `Vpa` references aggregates by key only; the aggregates themselves
//! live in the cluster state and are passed in where a method needs them.

use super::aggregate::{AggregateContainerState, AggregationKey};
use super::labels::LabelSelector;
use crate::error::HistogramError;
use crate::models::{
    ConditionType, ContainerResourcePolicy, Labels, PodResourcePolicy, RecommendedPodResources,
    UpdateMode, VpaCondition, VpaId, VpaStatus,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Aggregates owned by the cluster state, by key
pub type AggregateStateMap = HashMap<AggregationKey, AggregateContainerState>;

/// Per-container aggregates folded across label sets
pub type ContainerNameToAggregateStateMap = BTreeMap<String, AggregateContainerState>;

#[derive(Debug, Clone)]
pub struct Vpa {
    pub id: VpaId,
    pub pod_selector: LabelSelector,
    pub conditions: BTreeMap<ConditionType, VpaCondition>,
    /// Latest recommendation, as read from the store or computed
    pub recommendation: Option<RecommendedPodResources>,
    aggregate_keys: BTreeSet<AggregationKey>,
    resource_policy: Option<PodResourcePolicy>,
    update_mode: Option<UpdateMode>,
    /// History restored from checkpoints, keyed by container name
    pub containers_initial_aggregate_state: ContainerNameToAggregateStateMap,
    pub created: DateTime<Utc>,
    pub checkpoint_written: Option<DateTime<Utc>>,
    /// Number of live pods matched by the selector
    pub pod_count: usize,
}

impl Vpa {
    pub fn new(id: VpaId, pod_selector: LabelSelector, created: DateTime<Utc>) -> Self {
        Self {
            id,
            pod_selector,
            conditions: BTreeMap::new(),
            recommendation: None,
            aggregate_keys: BTreeSet::new(),
            resource_policy: None,
            update_mode: None,
            containers_initial_aggregate_state: BTreeMap::new(),
            created,
            checkpoint_written: None,
            pod_count: 0,
        }
    }

    pub fn resource_policy(&self) -> Option<&PodResourcePolicy> {
        self.resource_policy.as_ref()
    }

    pub fn update_mode(&self) -> Option<UpdateMode> {
        self.update_mode
    }

    pub fn aggregate_keys(&self) -> impl Iterator<Item = &AggregationKey> {
        self.aggregate_keys.iter()
    }

    pub fn uses_aggregation(&self, key: &AggregationKey) -> bool {
        self.aggregate_keys.contains(key)
    }

    /// True if a pod with `labels` in `namespace` falls under this policy
    pub fn matches_pod(&self, namespace: &str, labels: &Labels) -> bool {
        self.id.namespace == namespace && self.pod_selector.matches(labels)
    }

    /// Start tracking `aggregation` if its key falls under this policy
    pub fn use_aggregation_if_matching(
        &mut self,
        key: &AggregationKey,
        labels: &Labels,
        aggregation: &mut AggregateContainerState,
    ) -> bool {
        if self.uses_aggregation(key) || !self.matches_pod(&key.namespace, labels) {
            return false;
        }
        self.aggregate_keys.insert(key.clone());
        aggregation.is_under_vpa = true;
        aggregation.update_mode = self.update_mode;
        aggregation.update_from_policy(self.container_policy(&key.container_name));
        true
    }

    /// Stop tracking an aggregate. Returns true if it was tracked.
    pub fn delete_aggregation(&mut self, key: &AggregationKey) -> bool {
        self.aggregate_keys.remove(key)
    }

    fn container_policy(&self, container_name: &str) -> Option<&ContainerResourcePolicy> {
        self.resource_policy
            .as_ref()
            .and_then(|p| p.container_policy(container_name))
    }

    pub fn set_resource_policy(
        &mut self,
        policy: Option<PodResourcePolicy>,
        aggregates: &mut AggregateStateMap,
    ) {
        if policy == self.resource_policy {
            return;
        }
        self.resource_policy = policy;
        for key in &self.aggregate_keys {
            if let Some(state) = aggregates.get_mut(key) {
                let container_policy = self
                    .resource_policy
                    .as_ref()
                    .and_then(|p| p.container_policy(&key.container_name));
                state.update_from_policy(container_policy);
            }
        }
    }

    pub fn set_update_mode(&mut self, mode: Option<UpdateMode>, aggregates: &mut AggregateStateMap) {
        self.update_mode = mode;
        for key in &self.aggregate_keys {
            if let Some(state) = aggregates.get_mut(key) {
                state.update_mode = mode;
            }
        }
    }

    /// Store a recommendation and remember the uncapped target on each aggregate
    pub fn update_recommendation(
        &mut self,
        recommendation: RecommendedPodResources,
        aggregates: &mut AggregateStateMap,
    ) {
        for container in &recommendation.container_recommendations {
            for key in &self.aggregate_keys {
                if key.container_name != container.container_name {
                    continue;
                }
                if let Some(state) = aggregates.get_mut(key) {
                    state.last_recommendation = container.uncapped_target.clone();
                }
            }
        }
        self.recommendation = Some(recommendation);
    }

    pub fn has_recommendation(&self) -> bool {
        self.recommendation
            .as_ref()
            .map_or(false, |r| !r.is_empty())
    }

    pub fn has_matched_pods(&self) -> bool {
        self.pod_count > 0
    }

    /// Fold every tracked aggregate, plus checkpointed history, per container name
    pub fn aggregate_state_by_container_name(
        &self,
        aggregates: &AggregateStateMap,
    ) -> Result<ContainerNameToAggregateStateMap, HistogramError> {
        let mut by_name = ContainerNameToAggregateStateMap::new();
        for key in &self.aggregate_keys {
            let Some(state) = aggregates.get(key) else {
                continue;
            };
            merge_into(&mut by_name, &key.container_name, state)?;
        }
        for (name, initial) in &self.containers_initial_aggregate_state {
            merge_into(&mut by_name, name, initial)?;
        }
        Ok(by_name)
    }

    pub fn set_condition(
        &mut self,
        condition_type: ConditionType,
        status: bool,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) {
        let last_transition_time = match self.conditions.get(&condition_type) {
            Some(existing) if existing.status == status => existing.last_transition_time,
            _ => now,
        };
        self.conditions.insert(
            condition_type,
            VpaCondition {
                condition_type,
                status,
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time,
            },
        );
    }

    /// Maintain the `NoPodsMatched` and `RecommendationProvided` conditions
    pub fn update_conditions(&mut self, pods_matched: bool, now: DateTime<Utc>) {
        let (reason, message) = if pods_matched {
            self.conditions.remove(&ConditionType::NoPodsMatched);
            ("", "")
        } else {
            let reason = "NoPodsMatched";
            let message = "No pods match this VPA object";
            self.set_condition(ConditionType::NoPodsMatched, true, reason, message, now);
            (reason, message)
        };
        if self.has_recommendation() {
            self.set_condition(ConditionType::RecommendationProvided, true, "", "", now);
        } else {
            self.set_condition(
                ConditionType::RecommendationProvided,
                false,
                reason,
                message,
                now,
            );
        }
    }

    pub fn has_condition(&self, condition_type: ConditionType) -> bool {
        self.conditions
            .get(&condition_type)
            .map_or(false, |c| c.status)
    }

    /// Status sub-document to write back to the store
    pub fn as_status(&self) -> VpaStatus {
        VpaStatus {
            recommendation: self.recommendation.clone(),
            conditions: self.conditions.values().cloned().collect(),
        }
    }
}

fn merge_into(
    by_name: &mut ContainerNameToAggregateStateMap,
    container_name: &str,
    state: &AggregateContainerState,
) -> Result<(), HistogramError> {
    match by_name.get_mut(container_name) {
        Some(existing) => existing.merge(state)?,
        None => {
            by_name.insert(container_name.to_string(), state.clone());
        }
    }
    Ok(())
}
