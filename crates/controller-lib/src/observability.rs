//! Observability infrastructure for the cost controllers
//!
//! Provides:
//! - Prometheus self-metrics (reconcile latency, outcomes, queue depth)
//! - Structured JSON logging of cost events with tracing

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry};
use tracing::{info, warn};

/// Default histogram buckets for reconcile latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Outcome label values
pub mod outcomes {
    pub const SUCCESS: &str = "success";
    pub const RETRY: &str = "retry";
    pub const FAIL: &str = "fail";
}

/// Controller self-metrics for Prometheus exposition
///
/// Cloning is cheap; clones share the same underlying collectors.
#[derive(Clone)]
pub struct ControllerMetrics {
    reconcile_latency_seconds: HistogramVec,
    reconcile_outcomes: IntCounterVec,
    queue_depth: IntGauge,
}

impl ControllerMetrics {
    /// Create the collectors and register them in `registry`
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let reconcile_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "costwatch_reconcile_latency_seconds",
                "Time spent in one reconciliation cycle",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["controller"],
        )?;
        let reconcile_outcomes = IntCounterVec::new(
            Opts::new(
                "costwatch_reconcile_total",
                "Reconciliation cycles by controller and outcome",
            ),
            &["controller", "outcome"],
        )?;
        let queue_depth = IntGauge::new(
            "costwatch_queue_depth",
            "Keys waiting in the work queue",
        )?;

        registry.register(Box::new(reconcile_latency_seconds.clone()))?;
        registry.register(Box::new(reconcile_outcomes.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Self {
            reconcile_latency_seconds,
            reconcile_outcomes,
            queue_depth,
        })
    }

    pub fn observe_reconcile(&self, controller: &str, outcome: &str, duration_secs: f64) {
        self.reconcile_latency_seconds
            .with_label_values(&[controller])
            .observe(duration_secs);
        self.reconcile_outcomes
            .with_label_values(&[controller, outcome])
            .inc();
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as i64);
    }

    pub fn outcome_count(&self, controller: &str, outcome: &str) -> u64 {
        self.reconcile_outcomes
            .with_label_values(&[controller, outcome])
            .get()
    }
}

/// Structured logger for cost events
///
/// Provides consistent JSON-formatted records for price refreshes,
/// unknown prices and published pod costs.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    /// Log a node price refresh that resolved to a known value
    pub fn log_node_cost_refreshed(&self, node: &str, hourly: f64, instance_type: &str) {
        info!(
            event = "node_cost_refreshed",
            instance = %self.instance,
            node = %node,
            hourly_cost = hourly,
            instance_type = %instance_type,
            "Node hourly cost refreshed"
        );
    }

    /// Log a node whose price cannot be determined
    pub fn log_node_cost_unknown(&self, node: &str) {
        warn!(
            event = "node_cost_unknown",
            instance = %self.instance,
            node = %node,
            "Node hourly cost is unknown"
        );
    }

    /// Log the removal of an unusable cached value
    pub fn log_cache_cleared(&self, node: &str, raw: &str) {
        warn!(
            event = "node_cost_cache_cleared",
            instance = %self.instance,
            node = %node,
            raw_value = %raw,
            "Cleared unusable cached hourly cost"
        );
    }

    pub fn log_pod_cost(
        &self,
        pod: &str,
        node: &str,
        owner_kind: &str,
        owner_name: &str,
        hourly: f64,
    ) {
        info!(
            event = "pod_cost_published",
            instance = %self.instance,
            pod = %pod,
            node = %node,
            owner_kind = %owner_kind,
            owner_name = %owner_name,
            hourly_cost = hourly,
            "Pod hourly cost published"
        );
    }

    /// Log controller startup
    pub fn log_startup(&self, version: &str, workers: usize) {
        info!(
            event = "controller_started",
            instance = %self.instance,
            controller_version = %version,
            workers = workers,
            "Cost controller started"
        );
    }

    /// Log controller shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "controller_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Cost controller shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_metrics_register_into_injected_registry() {
        let registry = Registry::new();
        let metrics = ControllerMetrics::new(&registry).unwrap();

        metrics.observe_reconcile("node", outcomes::SUCCESS, 0.01);
        metrics.observe_reconcile("node", outcomes::RETRY, 0.02);
        metrics.observe_reconcile("node", outcomes::RETRY, 0.02);
        metrics.set_queue_depth(3);

        assert_eq!(metrics.outcome_count("node", outcomes::RETRY), 2);
        assert_eq!(metrics.outcome_count("pod", outcomes::RETRY), 0);

        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|f| f.get_name().to_string())
            .collect();
        assert!(names.contains(&"costwatch_reconcile_total".to_string()));
        assert!(names.contains(&"costwatch_queue_depth".to_string()));
    }

    #[test]
    fn test_separate_registries_do_not_collide() {
        let a = Registry::new();
        let b = Registry::new();
        assert!(ControllerMetrics::new(&a).is_ok());
        assert!(ControllerMetrics::new(&b).is_ok());
        assert!(ControllerMetrics::new(&a).is_err());
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("costwatch-0");
        assert_eq!(logger.instance, "costwatch-0");
    }
}
