//! Recommendation capping
//!
//! Clamps recommendations to a container's declared limits and to the
//! min/max allowed by the resource policy. Annotations describing each
//! adjustment are produced for the target only.

use crate::models::{
    ContainerResourcePolicy, PodResourcePolicy, PodSnapshot, RecommendedContainerResources,
    RecommendedPodResources, Resources,
};
use std::collections::BTreeMap;

/// Capping notes per container name
pub type ContainerToAnnotations = BTreeMap<String, Vec<String>>;

/// A recommendation after capping, with the reasons for each change
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CappedRecommendation {
    pub recommendation: RecommendedPodResources,
    pub annotations: ContainerToAnnotations,
}

/// Apply policy min/max to every container of a recommendation
///
/// Used by the recommender before a recommendation is stored. Containers
/// whose scaling mode is `Off` are dropped.
pub fn apply_vpa_policy(
    recommendation: &RecommendedPodResources,
    policy: Option<&PodResourcePolicy>,
) -> RecommendedPodResources {
    let container_recommendations = recommendation
        .container_recommendations
        .iter()
        .filter_map(|container| {
            let container_policy = policy.and_then(|p| p.container_policy(&container.container_name));
            if container_policy.map_or(false, |p| p.scaling_disabled()) {
                return None;
            }
            let mut capped = container.clone();
            cap_to_policy(&mut capped.target, container_policy);
            cap_to_policy(&mut capped.lower_bound, container_policy);
            cap_to_policy(&mut capped.upper_bound, container_policy);
            Some(capped)
        })
        .collect();

    RecommendedPodResources {
        container_recommendations,
    }
}

/// Cap a recommendation for a specific pod
///
/// Container limits are applied first, then the policy. Recommendations
/// for containers the pod does not have are dropped.
pub fn cap_recommendation_for_pod(
    recommendation: &RecommendedPodResources,
    policy: Option<&PodResourcePolicy>,
    pod: &PodSnapshot,
) -> CappedRecommendation {
    let mut capped = CappedRecommendation::default();

    for container in &pod.containers {
        let Some(recommended) = recommendation.for_container(&container.name) else {
            continue;
        };
        let container_policy = policy.and_then(|p| p.container_policy(&container.name));
        if container_policy.map_or(false, |p| p.scaling_disabled()) {
            continue;
        }

        let (resources, annotations) =
            cap_container(recommended, &container.limits, container_policy);
        if !annotations.is_empty() {
            capped.annotations.insert(container.name.clone(), annotations);
        }
        capped.recommendation.container_recommendations.push(resources);
    }

    capped
}

fn cap_container(
    recommended: &RecommendedContainerResources,
    limits: &Resources,
    policy: Option<&ContainerResourcePolicy>,
) -> (RecommendedContainerResources, Vec<String>) {
    let mut capped = recommended.clone();

    let mut annotations = cap_to_limits(&mut capped.target, limits);
    annotations.extend(cap_to_policy(&mut capped.target, policy));
    cap_to_limits(&mut capped.lower_bound, limits);
    cap_to_policy(&mut capped.lower_bound, policy);
    cap_to_limits(&mut capped.upper_bound, limits);
    cap_to_policy(&mut capped.upper_bound, policy);

    (capped, annotations)
}

fn cap_to_limits(resources: &mut Resources, limits: &Resources) -> Vec<String> {
    let mut annotations = Vec::new();
    for (kind, amount) in resources.iter_mut() {
        if let Some(limit) = limits.get(kind) {
            if *amount > *limit {
                *amount = *limit;
                annotations.push(format!("{} capped to container limit", kind));
            }
        }
    }
    annotations
}

fn cap_to_policy(resources: &mut Resources, policy: Option<&ContainerResourcePolicy>) -> Vec<String> {
    let mut annotations = Vec::new();
    let Some(policy) = policy else {
        return annotations;
    };
    for (kind, amount) in resources.iter_mut() {
        if let Some(min) = policy.min_allowed.get(kind) {
            if *amount < *min {
                *amount = *min;
                annotations.push(format!("{} capped to minAllowed", kind));
            }
        }
        if let Some(max) = policy.max_allowed.get(kind) {
            if *amount > *max {
                *amount = *max;
                annotations.push(format!("{} capped to maxAllowed", kind));
            }
        }
    }
    annotations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContainerScalingMode, ContainerSpec, PodPhase, ResourceAmount, ResourceKind};

    const MIB: i64 = 1024 * 1024;

    fn resources(cpu: i64, memory: i64) -> Resources {
        let mut r = Resources::new();
        r.insert(ResourceKind::Cpu, ResourceAmount(cpu));
        r.insert(ResourceKind::Memory, ResourceAmount(memory));
        r
    }

    fn recommendation(name: &str, target: Resources) -> RecommendedPodResources {
        RecommendedPodResources {
            container_recommendations: vec![RecommendedContainerResources {
                container_name: name.to_string(),
                lower_bound: target.clone(),
                upper_bound: target.clone(),
                uncapped_target: target.clone(),
                target,
            }],
        }
    }

    fn policy(name: &str, min: Resources, max: Resources) -> PodResourcePolicy {
        PodResourcePolicy {
            container_policies: vec![ContainerResourcePolicy {
                container_name: name.to_string(),
                mode: None,
                min_allowed: min,
                max_allowed: max,
                controlled_resources: None,
            }],
        }
    }

    fn pod(containers: Vec<ContainerSpec>) -> PodSnapshot {
        PodSnapshot {
            namespace: "ns".to_string(),
            name: "web-1".to_string(),
            labels: Default::default(),
            phase: PodPhase::Running,
            owner: None,
            start_time: None,
            deletion_timestamp: None,
            containers,
            container_statuses: Vec::new(),
        }
    }

    fn container(name: &str, limits: Resources) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            requests: Resources::new(),
            limits,
        }
    }

    #[test]
    fn test_cap_to_max_allowed() {
        let rec = recommendation("app", resources(250, 200 * MIB));
        let policy = policy("app", Resources::new(), resources(233, 150 * MIB));
        let capped = cap_recommendation_for_pod(
            &rec,
            Some(&policy),
            &pod(vec![container("app", Resources::new())]),
        );

        let app = capped.recommendation.for_container("app").unwrap();
        assert_eq!(app.target, resources(233, 150 * MIB));
        assert_eq!(app.uncapped_target, resources(250, 200 * MIB));
        assert_eq!(
            capped.annotations["app"],
            vec!["cpu capped to maxAllowed", "memory capped to maxAllowed"]
        );
    }

    #[test]
    fn test_cap_to_min_allowed_applies_to_bounds() {
        let mut rec = recommendation("app", resources(50, 100 * MIB));
        rec.container_recommendations[0].lower_bound = resources(10, 50 * MIB);
        let policy = policy("*", resources(100, 64 * MIB), Resources::new());

        let capped = apply_vpa_policy(&rec, Some(&policy));
        let app = capped.for_container("app").unwrap();
        assert_eq!(app.target, resources(100, 100 * MIB));
        assert_eq!(app.lower_bound, resources(100, 64 * MIB));
    }

    #[test]
    fn test_container_limit_applied_before_policy() {
        let rec = recommendation("app", resources(800, 100 * MIB));
        let mut limits = Resources::new();
        limits.insert(ResourceKind::Cpu, ResourceAmount(500));
        let policy = policy("app", resources(600, 0), Resources::new());

        let capped = cap_recommendation_for_pod(&rec, Some(&policy), &pod(vec![container("app", limits)]));
        let app = capped.recommendation.for_container("app").unwrap();
        assert_eq!(app.target[&ResourceKind::Cpu], ResourceAmount(600));
        assert_eq!(
            capped.annotations["app"],
            vec!["cpu capped to container limit", "cpu capped to minAllowed"]
        );
    }

    #[test]
    fn test_missing_container_recommendation_dropped() {
        let rec = recommendation("gone", resources(100, 100 * MIB));
        let capped = cap_recommendation_for_pod(&rec, None, &pod(vec![container("app", Resources::new())]));
        assert!(capped.recommendation.is_empty());
        assert!(capped.annotations.is_empty());
    }

    #[test]
    fn test_scaling_disabled_container_dropped() {
        let rec = recommendation("app", resources(100, 100 * MIB));
        let mut policy = policy("app", Resources::new(), Resources::new());
        policy.container_policies[0].mode = Some(ContainerScalingMode::Off);
        assert!(apply_vpa_policy(&rec, Some(&policy)).is_empty());
    }
}
