//! Resource estimators
//!
//! Estimators turn an aggregate's histograms into amounts. They compose as
//! a chain: a percentile estimator at the bottom, wrapped by a margin, a
//! confidence multiplier and a minimum floor.

mod recommender;

pub use recommender::{
    container_name_to_aggregate_state_map, filter_controlled_resources, EstimatorConfig,
    PodResourceRecommender,
};

use crate::cluster::AggregateContainerState;
use crate::models::{
    cpu_amount_from_cores, memory_amount_from_bytes, scale_resource, ResourceAmount,
    ResourceKind, Resources,
};

/// One link of an estimator chain
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceEstimator {
    /// Independent CPU and memory percentiles of the histograms
    Percentile {
        cpu_percentile: f64,
        memory_percentile: f64,
    },
    /// Adds `amount * margin_fraction` to the wrapped estimate
    Margin {
        margin_fraction: f64,
        base: Box<ResourceEstimator>,
    },
    /// Scales the wrapped estimate by `(1 + multiplier / confidence) ^ exponent`
    ConfidenceMultiplier {
        multiplier: f64,
        exponent: f64,
        base: Box<ResourceEstimator>,
    },
    /// Raises each resource of the wrapped estimate to at least the given minimum
    MinResources {
        min_resources: Resources,
        base: Box<ResourceEstimator>,
    },
}

impl ResourceEstimator {
    pub fn percentile(cpu_percentile: f64, memory_percentile: f64) -> Self {
        ResourceEstimator::Percentile {
            cpu_percentile,
            memory_percentile,
        }
    }

    pub fn with_margin(self, margin_fraction: f64) -> Self {
        ResourceEstimator::Margin {
            margin_fraction,
            base: Box::new(self),
        }
    }

    pub fn with_confidence_multiplier(self, multiplier: f64, exponent: f64) -> Self {
        ResourceEstimator::ConfidenceMultiplier {
            multiplier,
            exponent,
            base: Box::new(self),
        }
    }

    pub fn with_min_resources(self, min_resources: Resources) -> Self {
        ResourceEstimator::MinResources {
            min_resources,
            base: Box::new(self),
        }
    }

    pub fn estimate(&self, state: &AggregateContainerState) -> Resources {
        match self {
            ResourceEstimator::Percentile {
                cpu_percentile,
                memory_percentile,
            } => {
                let mut resources = Resources::new();
                resources.insert(
                    ResourceKind::Cpu,
                    cpu_amount_from_cores(state.cpu_histogram().percentile(*cpu_percentile)),
                );
                resources.insert(
                    ResourceKind::Memory,
                    memory_amount_from_bytes(
                        state.memory_peaks_histogram().percentile(*memory_percentile),
                    ),
                );
                resources
            }
            ResourceEstimator::Margin {
                margin_fraction,
                base,
            } => base
                .estimate(state)
                .into_iter()
                .map(|(kind, amount)| {
                    let margin = ResourceAmount::from_f64(amount.0 as f64 * margin_fraction);
                    (kind, amount + margin)
                })
                .collect(),
            ResourceEstimator::ConfidenceMultiplier {
                multiplier,
                exponent,
                base,
            } => {
                let factor = (1.0 + multiplier / confidence(state)).powf(*exponent);
                base.estimate(state)
                    .into_iter()
                    .map(|(kind, amount)| (kind, scale_resource(amount, factor)))
                    .collect()
            }
            ResourceEstimator::MinResources {
                min_resources,
                base,
            } => base
                .estimate(state)
                .into_iter()
                .map(|(kind, amount)| {
                    let min = min_resources.get(&kind).copied().unwrap_or_default();
                    (kind, amount.max(min))
                })
                .collect(),
        }
    }
}

/// How much history backs an aggregate, in days
///
/// The smaller of the time span covered by samples and the sample count
/// normalised to one sample per minute.
pub fn confidence(state: &AggregateContainerState) -> f64 {
    let lifespan_days = match (state.first_sample_start(), state.last_sample_start()) {
        (Some(first), Some(last)) => (last - first).num_milliseconds() as f64 / 86_400_000.0,
        _ => 0.0,
    };
    let samples_amount = state.total_samples_count() as f64 / (60.0 * 24.0);
    lifespan_days.min(samples_amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{AggregationsConfig, SampleAggregator};
    use crate::models::UsageSample;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()
    }

    /// 144 CPU samples of 500m, one every 10 minutes, and one memory peak
    fn state_with_history() -> AggregateContainerState {
        let config = AggregationsConfig::default();
        let mut state = AggregateContainerState::new(&config, t0());
        for i in 0..144 {
            state.add_sample(&UsageSample {
                measure_start: t0() + Duration::minutes(i * 10),
                resource: ResourceKind::Cpu,
                usage: ResourceAmount(500),
                request: ResourceAmount(1000),
            });
        }
        state.add_sample(&UsageSample {
            measure_start: t0(),
            resource: ResourceKind::Memory,
            usage: ResourceAmount(200_000_000),
            request: ResourceAmount(0),
        });
        state
    }

    #[test]
    fn test_percentile_estimator_is_conservative() {
        let state = state_with_history();
        let estimate = ResourceEstimator::percentile(0.9, 0.9).estimate(&state);

        let cpu = estimate[&ResourceKind::Cpu];
        assert!(cpu.0 > 500 && cpu.0 < 530);
        let memory = estimate[&ResourceKind::Memory];
        assert!(memory.0 > 200_000_000 && memory.0 < 220_000_000);
    }

    #[test]
    fn test_margin_adds_fraction() {
        let state = state_with_history();
        let base = ResourceEstimator::percentile(0.9, 0.9);
        let plain = base.estimate(&state);
        let with_margin = base.with_margin(0.15).estimate(&state);

        for kind in ResourceKind::ALL {
            let expected = plain[&kind] + ResourceAmount::from_f64(plain[&kind].0 as f64 * 0.15);
            assert_eq!(with_margin[&kind], expected);
        }
    }

    #[test]
    fn test_confidence() {
        let state = state_with_history();
        // Lifespan is almost a day, but 144 samples count as 0.1 day
        assert!((confidence(&state) - 0.1).abs() < 1e-12);

        let config = AggregationsConfig::default();
        assert_eq!(confidence(&AggregateContainerState::new(&config, t0())), 0.0);
    }

    #[test]
    fn test_confidence_multiplier_widens_bounds() {
        let state = state_with_history();
        let base = ResourceEstimator::percentile(0.9, 0.9);
        let plain = base.estimate(&state);

        let upper = base.clone().with_confidence_multiplier(1.0, 1.0).estimate(&state);
        assert_eq!(upper[&ResourceKind::Cpu], scale_resource(plain[&ResourceKind::Cpu], 11.0));

        let lower = base.with_confidence_multiplier(0.001, -2.0).estimate(&state);
        let factor = (1.0 + 0.001 / 0.1_f64).powf(-2.0);
        assert_eq!(
            lower[&ResourceKind::Memory],
            scale_resource(plain[&ResourceKind::Memory], factor)
        );
        assert!(lower[&ResourceKind::Memory] < plain[&ResourceKind::Memory]);
    }

    #[test]
    fn test_min_resources_floor_applies_without_samples() {
        let config = AggregationsConfig::default();
        let empty = AggregateContainerState::new(&config, t0());
        let mut floor = Resources::new();
        floor.insert(ResourceKind::Cpu, ResourceAmount(25));
        floor.insert(ResourceKind::Memory, ResourceAmount(262_144_000));

        let estimate = ResourceEstimator::percentile(0.9, 0.9)
            .with_margin(0.15)
            .with_confidence_multiplier(1.0, 1.0)
            .with_min_resources(floor.clone())
            .estimate(&empty);
        assert_eq!(estimate, floor);
    }
}
