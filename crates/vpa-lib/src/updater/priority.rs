//! Update priority of pods
//!
//! Compares each pod's live requests with its capped recommendation and
//! orders the pods that should be updated, largest relative change first.

use super::admission::PodEvictionAdmission;
use crate::capping::cap_recommendation_for_pod;
use crate::models::{PodResourcePolicy, PodSnapshot, RecommendedPodResources, ResourceKind};
use chrono::{DateTime, Duration, Utc};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::debug;

/// Thresholds deciding whether a pod is worth updating
#[derive(Debug, Clone)]
pub struct PriorityConfig {
    /// Smallest relative resource change that justifies an update (default: 0.10)
    pub min_change_priority: f64,
    /// Pods younger than this are left alone unless they OOM (default: 12 hours)
    pub pod_lifetime_update_threshold: Duration,
    /// An OOM kill this soon after container start is a quick OOM (default: 10 minutes)
    pub quick_oom_threshold: Duration,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            min_change_priority: 0.10,
            pod_lifetime_update_threshold: Duration::hours(12),
            quick_oom_threshold: Duration::minutes(10),
        }
    }
}

/// How urgently a pod should be updated
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PodPriority {
    /// Some request lies outside the recommended bounds
    pub outside_recommended_range: bool,
    /// Some recommendation exceeds its request
    pub scale_up: bool,
    /// Sum over resources of |request - recommendation| / request
    pub resource_diff: f64,
}

impl PodPriority {
    /// Scale-ups first, then larger differences
    fn cmp_urgency(&self, other: &Self) -> Ordering {
        other
            .scale_up
            .cmp(&self.scale_up)
            .then_with(|| {
                other
                    .resource_diff
                    .partial_cmp(&self.resource_diff)
                    .unwrap_or(Ordering::Equal)
            })
    }
}

/// A pod queued for update
#[derive(Debug, Clone)]
pub struct PrioritizedPod {
    pub pod: PodSnapshot,
    pub priority: PodPriority,
}

/// Collects the pods of one Vpa that should be updated
pub struct UpdatePriorityCalculator {
    policy: Option<PodResourcePolicy>,
    recommendation: RecommendedPodResources,
    config: PriorityConfig,
    pods: Vec<PrioritizedPod>,
}

impl UpdatePriorityCalculator {
    pub fn new(
        policy: Option<PodResourcePolicy>,
        recommendation: RecommendedPodResources,
        config: PriorityConfig,
    ) -> Self {
        Self {
            policy,
            recommendation,
            config,
            pods: Vec::new(),
        }
    }

    /// Compute the priority of a pod against the capped recommendation
    ///
    /// Returns `None` when no container of the pod has a recommendation.
    pub fn priority(&self, pod: &PodSnapshot) -> Option<PodPriority> {
        let capped = cap_recommendation_for_pod(&self.recommendation, self.policy.as_ref(), pod);
        if capped.recommendation.is_empty() {
            return None;
        }

        let mut priority = PodPriority::default();
        let mut total_request: BTreeMap<ResourceKind, i64> = BTreeMap::new();
        let mut total_recommended: BTreeMap<ResourceKind, i64> = BTreeMap::new();

        for container in &pod.containers {
            let Some(recommended) = capped.recommendation.for_container(&container.name) else {
                continue;
            };
            for (&kind, &target) in &recommended.target {
                *total_recommended.entry(kind).or_default() += target.value();
                match container.requests.get(&kind) {
                    Some(&request) => {
                        *total_request.entry(kind).or_default() += request.value();
                        if target > request {
                            priority.scale_up = true;
                        }
                        let below = recommended
                            .lower_bound
                            .get(&kind)
                            .map_or(false, |&lower| request < lower);
                        let above = recommended
                            .upper_bound
                            .get(&kind)
                            .map_or(false, |&upper| request > upper);
                        if below || above {
                            priority.outside_recommended_range = true;
                        }
                    }
                    None => {
                        // The pod runs on a default request
                        priority.scale_up = true;
                        priority.outside_recommended_range = true;
                    }
                }
            }
        }

        priority.resource_diff = total_recommended
            .iter()
            .map(|(kind, &recommended)| {
                let request = (total_request.get(kind).copied().unwrap_or(0) as f64).max(1.0);
                (request - recommended as f64).abs() / request
            })
            .sum();
        Some(priority)
    }

    /// A single-container pod OOM-killed shortly after it started
    fn is_quick_oom(&self, pod: &PodSnapshot) -> bool {
        if pod.container_statuses.len() != 1 {
            return false;
        }
        pod.container_statuses[0]
            .last_termination
            .as_ref()
            .map_or(false, |t| {
                t.is_oom_kill() && t.finished_at - t.started_at < self.config.quick_oom_threshold
            })
    }

    /// Queue a pod if it should be updated
    pub fn add_pod(&mut self, pod: &PodSnapshot, now: DateTime<Utc>) {
        let Some(priority) = self.priority(pod) else {
            debug!(pod = %pod.id(), "No recommendation for pod");
            return;
        };

        if self.is_quick_oom(pod) {
            if priority.resource_diff == 0.0 {
                debug!(pod = %pod.id(), "Pod OOMs but the recommendation equals its request");
                return;
            }
        } else {
            let Some(start_time) = pod.start_time else {
                debug!(pod = %pod.id(), "Pod has not started");
                return;
            };
            if now - start_time < self.config.pod_lifetime_update_threshold {
                debug!(pod = %pod.id(), "Pod is too young to update");
                return;
            }
            if !priority.outside_recommended_range
                && priority.resource_diff < self.config.min_change_priority
            {
                return;
            }
        }

        self.pods.push(PrioritizedPod {
            pod: pod.clone(),
            priority,
        });
    }

    /// Queued pods by urgency, filtered through `admission`
    pub fn sorted_pods(&self, admission: &dyn PodEvictionAdmission) -> Vec<PrioritizedPod> {
        let mut pods = self.pods.clone();
        pods.sort_by(|a, b| a.priority.cmp_urgency(&b.priority));
        pods.into_iter()
            .filter(|p| admission.admit(&p.pod, &self.recommendation))
            .collect()
    }
}
