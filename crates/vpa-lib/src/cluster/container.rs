//! Per-container sample bookkeeping
//!
//! A container does not own its history. It holds the aggregation key and
//! hands each accepted sample to whichever aggregate that key resolves to,
//! so relabeling a pod is only a key update.

use super::aggregate::{AggregationKey, AggregationsConfig, SampleAggregator};
use crate::models::{
    memory_amount_from_bytes, resource_amount_max, scale_resource, ResourceAmount, ResourceKind,
    Resources, UsageSample,
};
use chrono::{DateTime, Duration, Utc};

/// Sample state of one running container
#[derive(Debug, Clone)]
pub struct ContainerState {
    /// Requested resources of the container
    pub request: Resources,
    aggregation_key: AggregationKey,
    last_cpu_sample_start: Option<DateTime<Utc>>,
    /// Peak memory usage seen in the current window
    memory_peak: ResourceAmount,
    /// Peak memory bump derived from an OOM kill in the current window
    oom_peak: ResourceAmount,
    /// End of the current memory peak window
    window_end: Option<DateTime<Utc>>,
    last_memory_sample_start: Option<DateTime<Utc>>,
}

impl ContainerState {
    pub fn new(request: Resources, aggregation_key: AggregationKey) -> Self {
        Self {
            request,
            aggregation_key,
            last_cpu_sample_start: None,
            memory_peak: ResourceAmount::ZERO,
            oom_peak: ResourceAmount::ZERO,
            window_end: None,
            last_memory_sample_start: None,
        }
    }

    pub fn aggregation_key(&self) -> &AggregationKey {
        &self.aggregation_key
    }

    pub(crate) fn set_aggregation_key(&mut self, key: AggregationKey) {
        self.aggregation_key = key;
    }

    pub fn window_end(&self) -> Option<DateTime<Utc>> {
        self.window_end
    }

    /// Highest memory peak of the current window, OOM bumps included
    pub fn max_memory_peak(&self) -> ResourceAmount {
        resource_amount_max(self.memory_peak, self.oom_peak)
    }

    /// Route a sample to the aggregate. Returns false if the sample was rejected.
    pub fn add_sample(
        &mut self,
        sample: &UsageSample,
        aggregator: &mut dyn SampleAggregator,
        config: &AggregationsConfig,
    ) -> bool {
        match sample.resource {
            ResourceKind::Cpu => self.add_cpu_sample(sample, aggregator),
            ResourceKind::Memory => self.add_memory_sample(sample, false, aggregator, config),
        }
    }

    fn add_cpu_sample(&mut self, sample: &UsageSample, aggregator: &mut dyn SampleAggregator) -> bool {
        if !sample.is_valid(ResourceKind::Cpu)
            || self
                .last_cpu_sample_start
                .map_or(false, |last| sample.measure_start <= last)
        {
            return false;
        }
        aggregator.add_sample(sample);
        self.last_cpu_sample_start = Some(sample.measure_start);
        true
    }

    fn add_memory_sample(
        &mut self,
        sample: &UsageSample,
        is_oom: bool,
        aggregator: &mut dyn SampleAggregator,
        config: &AggregationsConfig,
    ) -> bool {
        let ts = sample.measure_start;
        // OOM samples are accepted out of order
        if !sample.is_valid(ResourceKind::Memory)
            || (!is_oom
                && self
                    .last_memory_sample_start
                    .map_or(false, |last| ts < last))
        {
            return false;
        }
        self.last_memory_sample_start = Some(ts);
        let window_end = *self.window_end.get_or_insert(ts);

        let mut add_new_peak = false;
        if ts < window_end {
            let old_peak = self.max_memory_peak();
            if !old_peak.is_zero() && sample.usage > old_peak {
                aggregator.subtract_sample(&UsageSample {
                    measure_start: window_end,
                    resource: ResourceKind::Memory,
                    usage: old_peak,
                    request: sample.request,
                });
                add_new_peak = true;
            }
        } else {
            let interval = config.memory_aggregation_interval;
            let shift = truncate(ts - window_end, interval) + interval;
            self.window_end = Some(window_end + shift);
            self.memory_peak = ResourceAmount::ZERO;
            self.oom_peak = ResourceAmount::ZERO;
            add_new_peak = true;
        }

        if add_new_peak {
            if let Some(window_end) = self.window_end {
                aggregator.add_sample(&UsageSample {
                    measure_start: window_end,
                    resource: ResourceKind::Memory,
                    usage: sample.usage,
                    request: sample.request,
                });
            }
            if is_oom {
                self.oom_peak = sample.usage;
            } else {
                self.memory_peak = sample.usage;
            }
        }
        true
    }

    /// Record an OOM kill as a bumped-up memory sample
    ///
    /// Returns false if the event predates the previous window.
    pub fn record_oom(
        &mut self,
        timestamp: DateTime<Utc>,
        requested_memory: ResourceAmount,
        aggregator: &mut dyn SampleAggregator,
        config: &AggregationsConfig,
    ) -> bool {
        if let Some(window_end) = self.window_end {
            if timestamp < window_end - config.memory_aggregation_interval {
                return false;
            }
        }
        // The OOM peak is left out so repeated kills do not compound
        let memory_used = resource_amount_max(requested_memory, self.memory_peak);
        let memory_needed = resource_amount_max(
            memory_used + memory_amount_from_bytes(config.oom_min_bump_up_bytes),
            scale_resource(memory_used, config.oom_bump_up_ratio),
        );
        let sample = UsageSample {
            measure_start: timestamp,
            resource: ResourceKind::Memory,
            usage: memory_needed,
            request: requested_memory,
        };
        self.add_memory_sample(&sample, true, aggregator, config)
    }
}

/// Round a non-negative duration down to a multiple of `step`
fn truncate(duration: Duration, step: Duration) -> Duration {
    let step_ms = step.num_milliseconds();
    if step_ms <= 0 {
        return duration;
    }
    let ms = duration.num_milliseconds();
    Duration::milliseconds(ms - ms % step_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::labels::LabelSetInterner;
    use crate::models::Labels;
    use chrono::TimeZone;

    #[derive(Debug, PartialEq)]
    enum Call {
        Add(i64, DateTime<Utc>),
        Subtract(i64, DateTime<Utc>),
    }

    #[derive(Default)]
    struct RecordingAggregator {
        calls: Vec<Call>,
    }

    impl SampleAggregator for RecordingAggregator {
        fn add_sample(&mut self, sample: &UsageSample) {
            self.calls.push(Call::Add(sample.usage.0, sample.measure_start));
        }

        fn subtract_sample(&mut self, sample: &UsageSample) {
            self.calls
                .push(Call::Subtract(sample.usage.0, sample.measure_start));
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn container() -> ContainerState {
        let mut interner = LabelSetInterner::new();
        let labels = interner.intern(&Labels::new());
        ContainerState::new(Resources::new(), AggregationKey::new("ns", "app", labels))
    }

    fn sample(resource: ResourceKind, at: DateTime<Utc>, usage: i64) -> UsageSample {
        UsageSample {
            measure_start: at,
            resource,
            usage: ResourceAmount(usage),
            request: ResourceAmount(1000),
        }
    }

    #[test]
    fn test_cpu_samples_must_move_forward() {
        let config = AggregationsConfig::default();
        let mut state = container();
        let mut aggregator = RecordingAggregator::default();

        assert!(state.add_sample(&sample(ResourceKind::Cpu, start(), 100), &mut aggregator, &config));
        assert!(!state.add_sample(&sample(ResourceKind::Cpu, start(), 100), &mut aggregator, &config));
        assert!(!state.add_sample(
            &sample(ResourceKind::Cpu, start() - Duration::minutes(1), 100),
            &mut aggregator,
            &config
        ));
        assert!(state.add_sample(
            &sample(ResourceKind::Cpu, start() + Duration::minutes(1), 100),
            &mut aggregator,
            &config
        ));
        assert_eq!(aggregator.calls.len(), 2);
    }

    #[test]
    fn test_negative_usage_rejected() {
        let config = AggregationsConfig::default();
        let mut state = container();
        let mut aggregator = RecordingAggregator::default();

        assert!(!state.add_sample(&sample(ResourceKind::Memory, start(), -1), &mut aggregator, &config));
        assert!(aggregator.calls.is_empty());
    }

    #[test]
    fn test_memory_peak_replaced_within_window() {
        let config = AggregationsConfig::default();
        let mut state = container();
        let mut aggregator = RecordingAggregator::default();
        let window_end = start() + Duration::hours(24);

        assert!(state.add_sample(&sample(ResourceKind::Memory, start(), 1_000), &mut aggregator, &config));
        assert!(state.add_sample(
            &sample(ResourceKind::Memory, start() + Duration::hours(1), 2_000),
            &mut aggregator,
            &config
        ));

        assert_eq!(
            aggregator.calls,
            vec![
                Call::Add(1_000, window_end),
                Call::Subtract(1_000, window_end),
                Call::Add(2_000, window_end),
            ]
        );
        assert_eq!(state.max_memory_peak(), ResourceAmount(2_000));
    }

    #[test]
    fn test_smaller_memory_sample_in_window_ignored() {
        let config = AggregationsConfig::default();
        let mut state = container();
        let mut aggregator = RecordingAggregator::default();

        state.add_sample(&sample(ResourceKind::Memory, start(), 2_000), &mut aggregator, &config);
        assert!(state.add_sample(
            &sample(ResourceKind::Memory, start() + Duration::hours(1), 1_000),
            &mut aggregator,
            &config
        ));
        assert_eq!(aggregator.calls.len(), 1);
    }

    #[test]
    fn test_memory_window_rotates() {
        let config = AggregationsConfig::default();
        let mut state = container();
        let mut aggregator = RecordingAggregator::default();

        state.add_sample(&sample(ResourceKind::Memory, start(), 2_000), &mut aggregator, &config);
        // 2.5 intervals past the window end of the first sample
        state.add_sample(
            &sample(ResourceKind::Memory, start() + Duration::hours(84), 500),
            &mut aggregator,
            &config,
        );

        assert_eq!(state.window_end(), Some(start() + Duration::hours(96)));
        assert_eq!(state.max_memory_peak(), ResourceAmount(500));
        assert_eq!(
            aggregator.calls.last(),
            Some(&Call::Add(500, start() + Duration::hours(96)))
        );
    }

    #[test]
    fn test_out_of_order_memory_rejected() {
        let config = AggregationsConfig::default();
        let mut state = container();
        let mut aggregator = RecordingAggregator::default();

        state.add_sample(&sample(ResourceKind::Memory, start(), 2_000), &mut aggregator, &config);
        assert!(!state.add_sample(
            &sample(ResourceKind::Memory, start() - Duration::minutes(1), 3_000),
            &mut aggregator,
            &config
        ));
    }

    #[test]
    fn test_record_oom_bumps_memory() {
        let config = AggregationsConfig::default();
        let mut state = container();
        let mut aggregator = RecordingAggregator::default();
        let gib = 1024 * 1024 * 1024;

        assert!(state.record_oom(start(), ResourceAmount(gib), &mut aggregator, &config));
        // 1.2 x 1GiB beats 1GiB + 100MiB
        let expected = (gib as f64 * 1.2) as i64;
        assert_eq!(
            aggregator.calls,
            vec![Call::Add(expected, start() + Duration::hours(24))]
        );
        assert_eq!(state.max_memory_peak(), ResourceAmount(expected));
    }

    #[test]
    fn test_record_oom_uses_min_bump_for_small_containers() {
        let config = AggregationsConfig::default();
        let mut state = container();
        let mut aggregator = RecordingAggregator::default();
        let mib = 1024 * 1024;

        assert!(state.record_oom(start(), ResourceAmount(100 * mib), &mut aggregator, &config));
        assert_eq!(state.max_memory_peak(), ResourceAmount(200 * mib));
    }

    #[test]
    fn test_stale_oom_rejected() {
        let config = AggregationsConfig::default();
        let mut state = container();
        let mut aggregator = RecordingAggregator::default();

        state.add_sample(&sample(ResourceKind::Memory, start(), 1_000), &mut aggregator, &config);
        // Window ends at start + 24h; anything before start is stale
        assert!(!state.record_oom(
            start() - Duration::hours(1),
            ResourceAmount(1_000),
            &mut aggregator,
            &config
        ));
        assert!(state.record_oom(start(), ResourceAmount(1_000), &mut aggregator, &config));
    }
}
