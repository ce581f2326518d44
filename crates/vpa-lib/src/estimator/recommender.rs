//! Pod-level recommendation assembly

use super::ResourceEstimator;
use crate::cluster::{AggregateStateMap, ContainerNameToAggregateStateMap, Vpa};
use crate::error::HistogramError;
use crate::models::{
    cpu_amount_from_cores, memory_amount_from_bytes, scale_resource, ContainerScalingMode,
    RecommendedContainerResources, RecommendedPodResources, ResourceKind, Resources,
};
use serde::{Deserialize, Serialize};

/// Percentiles, margins and floors of the three estimator chains
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    pub target_cpu_percentile: f64,
    pub target_memory_percentile: f64,
    pub lower_bound_cpu_percentile: f64,
    pub lower_bound_memory_percentile: f64,
    pub upper_bound_cpu_percentile: f64,
    pub upper_bound_memory_percentile: f64,
    pub safety_margin_fraction: f64,
    /// Minimum CPU for a whole pod, split evenly across its containers
    pub pod_min_cpu_millicores: f64,
    /// Minimum memory for a whole pod, split evenly across its containers
    pub pod_min_memory_mb: f64,
    pub upper_bound_confidence_multiplier: f64,
    pub upper_bound_confidence_exponent: f64,
    pub lower_bound_confidence_multiplier: f64,
    pub lower_bound_confidence_exponent: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            target_cpu_percentile: 0.9,
            target_memory_percentile: 0.9,
            lower_bound_cpu_percentile: 0.5,
            lower_bound_memory_percentile: 0.5,
            upper_bound_cpu_percentile: 0.95,
            upper_bound_memory_percentile: 0.95,
            safety_margin_fraction: 0.15,
            pod_min_cpu_millicores: 25.0,
            pod_min_memory_mb: 250.0,
            upper_bound_confidence_multiplier: 1.0,
            upper_bound_confidence_exponent: 1.0,
            lower_bound_confidence_multiplier: 0.001,
            lower_bound_confidence_exponent: -2.0,
        }
    }
}

/// Computes target, lower bound and upper bound for every container of a pod
#[derive(Debug, Clone)]
pub struct PodResourceRecommender {
    target: ResourceEstimator,
    lower_bound: ResourceEstimator,
    upper_bound: ResourceEstimator,
    pod_min_cpu_millicores: f64,
    pod_min_memory_mb: f64,
}

impl PodResourceRecommender {
    pub fn new(config: &EstimatorConfig) -> Self {
        let target = ResourceEstimator::percentile(
            config.target_cpu_percentile,
            config.target_memory_percentile,
        )
        .with_margin(config.safety_margin_fraction);
        let lower_bound = ResourceEstimator::percentile(
            config.lower_bound_cpu_percentile,
            config.lower_bound_memory_percentile,
        )
        .with_margin(config.safety_margin_fraction)
        .with_confidence_multiplier(
            config.lower_bound_confidence_multiplier,
            config.lower_bound_confidence_exponent,
        );
        let upper_bound = ResourceEstimator::percentile(
            config.upper_bound_cpu_percentile,
            config.upper_bound_memory_percentile,
        )
        .with_margin(config.safety_margin_fraction)
        .with_confidence_multiplier(
            config.upper_bound_confidence_multiplier,
            config.upper_bound_confidence_exponent,
        );

        Self {
            target,
            lower_bound,
            upper_bound,
            pod_min_cpu_millicores: config.pod_min_cpu_millicores,
            pod_min_memory_mb: config.pod_min_memory_mb,
        }
    }

    /// Recommend resources for each container, sorted by container name
    ///
    /// `uncapped_target` equals `target`; policy capping happens later.
    pub fn recommend(&self, containers: &ContainerNameToAggregateStateMap) -> RecommendedPodResources {
        if containers.is_empty() {
            return RecommendedPodResources::default();
        }

        let fraction = 1.0 / containers.len() as f64;
        let mut min_resources = Resources::new();
        min_resources.insert(
            ResourceKind::Cpu,
            scale_resource(cpu_amount_from_cores(self.pod_min_cpu_millicores * 0.001), fraction),
        );
        min_resources.insert(
            ResourceKind::Memory,
            scale_resource(
                memory_amount_from_bytes(self.pod_min_memory_mb * 1024.0 * 1024.0),
                fraction,
            ),
        );
        let target = self.target.clone().with_min_resources(min_resources.clone());
        let lower_bound = self.lower_bound.clone().with_min_resources(min_resources.clone());
        let upper_bound = self.upper_bound.clone().with_min_resources(min_resources);

        let container_recommendations = containers
            .iter()
            .map(|(name, state)| {
                let controlled = &state.controlled_resources;
                let target = filter_controlled_resources(target.estimate(state), controlled);
                RecommendedContainerResources {
                    container_name: name.clone(),
                    uncapped_target: target.clone(),
                    target,
                    lower_bound: filter_controlled_resources(
                        lower_bound.estimate(state),
                        controlled,
                    ),
                    upper_bound: filter_controlled_resources(
                        upper_bound.estimate(state),
                        controlled,
                    ),
                }
            })
            .collect();

        RecommendedPodResources {
            container_recommendations,
        }
    }
}

impl Default for PodResourceRecommender {
    fn default() -> Self {
        Self::new(&EstimatorConfig::default())
    }
}

/// Keep only the resources a container policy controls
pub fn filter_controlled_resources(resources: Resources, controlled: &[ResourceKind]) -> Resources {
    resources
        .into_iter()
        .filter(|(kind, _)| controlled.contains(kind))
        .collect()
}

/// Per-container aggregates of a Vpa that should receive a recommendation
///
/// Containers with scaling disabled or without a single sample are left out.
pub fn container_name_to_aggregate_state_map(
    vpa: &Vpa,
    aggregates: &AggregateStateMap,
) -> Result<ContainerNameToAggregateStateMap, HistogramError> {
    let mut by_name = vpa.aggregate_state_by_container_name(aggregates)?;
    by_name.retain(|name, state| {
        let disabled = vpa
            .resource_policy()
            .and_then(|p| p.container_policy(name))
            .map_or(false, |p| p.mode == Some(ContainerScalingMode::Off));
        !disabled && state.total_samples_count() > 0
    });
    Ok(by_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{
        AggregateContainerState, AggregationKey, AggregationsConfig, LabelSelector,
        LabelSetInterner, SampleAggregator,
    };
    use crate::models::{
        ContainerResourcePolicy, Labels, PodResourcePolicy, ResourceAmount, UsageSample, VpaId,
    };
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn state_with_cpu(cores_millis: i64, samples: i64) -> AggregateContainerState {
        let mut state = AggregateContainerState::new(&AggregationsConfig::default(), t0());
        for i in 0..samples {
            state.add_sample(&UsageSample {
                measure_start: t0() + Duration::minutes(i),
                resource: ResourceKind::Cpu,
                usage: ResourceAmount(cores_millis),
                request: ResourceAmount(1000),
            });
        }
        state
    }

    #[test]
    fn test_empty_pod_gets_empty_recommendation() {
        let recommender = PodResourceRecommender::default();
        assert!(recommender
            .recommend(&ContainerNameToAggregateStateMap::new())
            .is_empty());
    }

    #[test]
    fn test_floor_split_across_containers() {
        let recommender = PodResourceRecommender::default();
        let mut containers = ContainerNameToAggregateStateMap::new();
        containers.insert("app".to_string(), state_with_cpu(0, 0));
        containers.insert("sidecar".to_string(), state_with_cpu(0, 0));

        let recommendation = recommender.recommend(&containers);
        let names: Vec<_> = recommendation
            .container_recommendations
            .iter()
            .map(|r| r.container_name.as_str())
            .collect();
        assert_eq!(names, vec!["app", "sidecar"]);

        let app = recommendation.for_container("app").unwrap();
        assert_eq!(app.target[&ResourceKind::Cpu], ResourceAmount(12));
        assert_eq!(app.target[&ResourceKind::Memory], ResourceAmount(131_072_000));
        assert_eq!(app.lower_bound, app.target);
        assert_eq!(app.upper_bound, app.target);
        assert_eq!(app.uncapped_target, app.target);
    }

    #[test]
    fn test_bounds_bracket_target() {
        let recommender = PodResourceRecommender::default();
        let mut containers = ContainerNameToAggregateStateMap::new();
        containers.insert("app".to_string(), state_with_cpu(2000, 600));

        let recommendation = recommender.recommend(&containers);
        let app = recommendation.for_container("app").unwrap();
        let cpu = |r: &Resources| r[&ResourceKind::Cpu];
        assert!(cpu(&app.target) > ResourceAmount(2000));
        assert!(cpu(&app.lower_bound) <= cpu(&app.target));
        assert!(cpu(&app.upper_bound) > cpu(&app.target));
    }

    #[test]
    fn test_controlled_resources_filter_output() {
        let recommender = PodResourceRecommender::default();
        let mut state = state_with_cpu(500, 10);
        state.controlled_resources = vec![ResourceKind::Memory];
        let mut containers = ContainerNameToAggregateStateMap::new();
        containers.insert("app".to_string(), state);

        let recommendation = recommender.recommend(&containers);
        let app = recommendation.for_container("app").unwrap();
        assert!(!app.target.contains_key(&ResourceKind::Cpu));
        assert!(app.target.contains_key(&ResourceKind::Memory));
        assert!(!app.upper_bound.contains_key(&ResourceKind::Cpu));
    }

    #[test]
    fn test_vpa_map_skips_disabled_and_empty_containers() {
        let mut vpa = Vpa::new(VpaId::new("ns", "vpa"), LabelSelector::default(), t0());
        let mut aggregates = AggregateStateMap::new();
        let labels = Labels::new();
        let label_set = LabelSetInterner::new().intern(&labels);
        for (name, samples) in [("app", 5), ("sidecar", 5), ("init", 0)] {
            let key = AggregationKey::new("ns", name, label_set);
            let mut state = state_with_cpu(100, samples);
            assert!(vpa.use_aggregation_if_matching(&key, &labels, &mut state));
            aggregates.insert(key, state);
        }
        vpa.set_resource_policy(
            Some(PodResourcePolicy {
                container_policies: vec![ContainerResourcePolicy {
                    container_name: "sidecar".to_string(),
                    mode: Some(ContainerScalingMode::Off),
                    min_allowed: Resources::new(),
                    max_allowed: Resources::new(),
                    controlled_resources: None,
                }],
            }),
            &mut aggregates,
        );

        let by_name = container_name_to_aggregate_state_map(&vpa, &aggregates).unwrap();
        assert_eq!(by_name.keys().collect::<Vec<_>>(), vec!["app"]);
    }
}
