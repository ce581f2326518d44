//! Observability infrastructure for the recommender and updater
//!
//! Provides:
//! - Prometheus metrics (loop latencies, tracked object counts, sample, OOM and eviction counters)
//! - Structured JSON logging of domain events with tracing

use crate::models::{PodId, RecommendedPodResources, ResourceKind, VpaId};
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for control loop latency (in seconds)
const LOOP_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ControllerMetricsInner> = OnceLock::new();

struct ControllerMetricsInner {
    recommender_loop_latency_seconds: Histogram,
    updater_loop_latency_seconds: Histogram,
    aggregate_container_states: IntGauge,
    tracked_vpas: IntGauge,
    tracked_pods: IntGauge,
    recommendations_computed: IntCounter,
    checkpoints_written: IntCounter,
    samples_dropped: IntCounter,
    oom_events_recorded: IntCounter,
    oom_events_dropped: IntCounter,
    evictions: IntCounter,
    evictions_failed: IntCounter,
}

impl ControllerMetricsInner {
    fn new() -> Self {
        Self {
            recommender_loop_latency_seconds: register_histogram!(
                "vpa_recommender_loop_latency_seconds",
                "Time spent in one recommender loop run",
                LOOP_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register recommender_loop_latency_seconds"),

            updater_loop_latency_seconds: register_histogram!(
                "vpa_updater_loop_latency_seconds",
                "Time spent in one updater loop run",
                LOOP_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register updater_loop_latency_seconds"),

            aggregate_container_states: register_int_gauge!(
                "vpa_recommender_aggregate_container_states",
                "Number of aggregate container states held in memory"
            )
            .expect("Failed to register aggregate_container_states"),

            tracked_vpas: register_int_gauge!(
                "vpa_recommender_vpa_objects",
                "Number of policy objects tracked by the recommender"
            )
            .expect("Failed to register tracked_vpas"),

            tracked_pods: register_int_gauge!(
                "vpa_recommender_pods",
                "Number of pods tracked by the recommender"
            )
            .expect("Failed to register tracked_pods"),

            recommendations_computed: register_int_counter!(
                "vpa_recommender_recommendations_total",
                "Total number of recommendations computed"
            )
            .expect("Failed to register recommendations_computed"),

            checkpoints_written: register_int_counter!(
                "vpa_recommender_checkpoints_written_total",
                "Total number of checkpoints written"
            )
            .expect("Failed to register checkpoints_written"),

            samples_dropped: register_int_counter!(
                "vpa_recommender_samples_dropped_total",
                "Total number of usage samples that could not be routed"
            )
            .expect("Failed to register samples_dropped"),

            oom_events_recorded: register_int_counter!(
                "vpa_recommender_oom_events_total",
                "Total number of OOM events recorded"
            )
            .expect("Failed to register oom_events_recorded"),

            oom_events_dropped: register_int_counter!(
                "vpa_recommender_oom_events_dropped_total",
                "Total number of OOM events dropped on a full channel"
            )
            .expect("Failed to register oom_events_dropped"),

            evictions: register_int_counter!(
                "vpa_updater_evictions_total",
                "Total number of pods evicted"
            )
            .expect("Failed to register evictions"),

            evictions_failed: register_int_counter!(
                "vpa_updater_evictions_failed_total",
                "Total number of failed eviction attempts"
            )
            .expect("Failed to register evictions_failed"),
        }
    }
}

/// Controller metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct ControllerMetrics {
    _private: (),
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ControllerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ControllerMetricsInner {
        GLOBAL_METRICS.get_or_init(ControllerMetricsInner::new)
    }

    pub fn observe_recommender_latency(&self, duration_secs: f64) {
        self.inner().recommender_loop_latency_seconds.observe(duration_secs);
    }

    pub fn observe_updater_latency(&self, duration_secs: f64) {
        self.inner().updater_loop_latency_seconds.observe(duration_secs);
    }

    /// Update the sizes of the cluster state
    pub fn set_cluster_state_size(&self, aggregates: usize, vpas: usize, pods: usize) {
        self.inner().aggregate_container_states.set(aggregates as i64);
        self.inner().tracked_vpas.set(vpas as i64);
        self.inner().tracked_pods.set(pods as i64);
    }

    pub fn inc_recommendations_computed(&self) {
        self.inner().recommendations_computed.inc();
    }

    pub fn add_checkpoints_written(&self, count: usize) {
        self.inner().checkpoints_written.inc_by(count as u64);
    }

    pub fn inc_samples_dropped(&self) {
        self.inner().samples_dropped.inc();
    }

    pub fn inc_oom_events_recorded(&self) {
        self.inner().oom_events_recorded.inc();
    }

    pub fn inc_oom_events_dropped(&self) {
        self.inner().oom_events_dropped.inc();
    }

    pub fn inc_evictions(&self) {
        self.inner().evictions.inc();
    }

    pub fn inc_evictions_failed(&self) {
        self.inner().evictions_failed.inc();
    }
}

/// Structured logger for controller events
///
/// Every event carries a stable `event` field and the emitting component.
#[derive(Clone)]
pub struct StructuredLogger {
    component: String,
}

impl StructuredLogger {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    /// Log a new recommendation for a policy object
    pub fn log_recommendation(&self, vpa: &VpaId, recommendation: &RecommendedPodResources) {
        for container in &recommendation.container_recommendations {
            let amount = |kind: ResourceKind| container.target.get(&kind).map(|a| a.value());
            info!(
                event = "recommendation_updated",
                component = %self.component,
                vpa = %vpa,
                container = %container.container_name,
                target_cpu_millicores = ?amount(ResourceKind::Cpu),
                target_memory_bytes = ?amount(ResourceKind::Memory),
                "Recommendation updated"
            );
        }
    }

    pub fn log_eviction(&self, pod: &PodId, vpa: &VpaId, priority: f64) {
        info!(
            event = "pod_evicted",
            component = %self.component,
            pod = %pod,
            vpa = %vpa,
            priority = priority,
            "Evicted pod to apply recommendation"
        );
    }

    pub fn log_eviction_failure(&self, pod: &PodId, vpa: &VpaId, error: &str) {
        warn!(
            event = "eviction_failed",
            component = %self.component,
            pod = %pod,
            vpa = %vpa,
            error = %error,
            "Failed to evict pod"
        );
    }

    pub fn log_checkpoints_written(&self, written: usize, failed: usize) {
        if failed > 0 {
            warn!(
                event = "checkpoint_written",
                component = %self.component,
                written = written,
                failed = failed,
                "Checkpoint run finished with failures"
            );
        } else {
            info!(
                event = "checkpoint_written",
                component = %self.component,
                written = written,
                "Checkpoint run finished"
            );
        }
    }

    pub fn log_checkpoint_gc(&self, namespace: &str, name: &str) {
        info!(
            event = "checkpoint_gc",
            component = %self.component,
            namespace = %namespace,
            checkpoint = %name,
            "Deleted checkpoint of removed policy object"
        );
    }

    pub fn log_aggregate_gc(&self, removed: usize, remaining: usize) {
        info!(
            event = "aggregate_gc",
            component = %self.component,
            removed = removed,
            remaining = remaining,
            "Garbage collected aggregate container states"
        );
    }

    pub fn log_oom(&self, pod: &PodId, container: &str, memory_bytes: i64) {
        info!(
            event = "oom_recorded",
            component = %self.component,
            pod = %pod,
            container = %container,
            memory_bytes = memory_bytes,
            "Recorded OOM kill"
        );
    }

    pub fn log_startup(&self, version: &str) {
        info!(
            event = "controller_started",
            component = %self.component,
            version = %version,
            "VPA controller started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "controller_shutdown",
            component = %self.component,
            reason = %reason,
            "VPA controller shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_metrics_creation() {
        // Handles share the global registry, so creating several is fine
        let metrics = ControllerMetrics::new();
        let other = metrics.clone();

        metrics.observe_recommender_latency(0.01);
        metrics.observe_updater_latency(0.02);
        metrics.set_cluster_state_size(3, 1, 2);
        metrics.inc_recommendations_computed();
        metrics.add_checkpoints_written(2);
        other.inc_samples_dropped();
        other.inc_oom_events_recorded();
        other.inc_oom_events_dropped();
        other.inc_evictions();
        other.inc_evictions_failed();

        let families = prometheus::gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "vpa_updater_evictions_total"));
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("recommender");
        assert_eq!(logger.component(), "recommender");
    }
}
