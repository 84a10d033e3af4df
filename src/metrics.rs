//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Delivery Metrics
    pub static ref DELIVERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("rallypoint_deliveries_total", "Total number of outbound activity deliveries"),
        &["status"]
    ).expect("metric can be created");
    pub static ref DELIVERY_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "rallypoint_delivery_duration_seconds",
            "Outbound delivery duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["status"]
    ).expect("metric can be created");

    // Dead-letter queue Metrics
    pub static ref DEAD_LETTERS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("rallypoint_dead_letters_total", "Dead-letter queue transitions"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref DEAD_LETTERS_PENDING: IntGauge = IntGauge::new(
        "rallypoint_dead_letters_pending",
        "Current number of pending dead-letter records"
    ).expect("metric can be created");

    // Job dispatcher Metrics
    pub static ref JOB_CYCLES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("rallypoint_job_cycles_total", "Dispatcher cycles executed"),
        &["job", "status"]
    ).expect("metric can be created");
    pub static ref JOB_ITEMS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("rallypoint_job_items_total", "Job items processed"),
        &["job", "status"]
    ).expect("metric can be created");

    // Instance poller Metrics
    pub static ref INSTANCE_POLLS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("rallypoint_instance_polls_total", "Remote instance poll attempts"),
        &["status"]
    ).expect("metric can be created");
    pub static ref REMOTE_ACTIVITIES_CACHED: IntCounterVec = IntCounterVec::new(
        Opts::new("rallypoint_remote_activities_cached_total", "Activities cached from remote public streams"),
        &["mode"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("rallypoint_errors_total", "Total number of errors"),
        &["error_type"]
    ).expect("metric can be created");
}

/// Register all metrics with the global registry.
///
/// Must be called once at startup; duplicate registration is logged
/// and ignored so tests can call it repeatedly.
pub fn init_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(DELIVERIES_TOTAL.clone()),
        Box::new(DELIVERY_DURATION_SECONDS.clone()),
        Box::new(DEAD_LETTERS_TOTAL.clone()),
        Box::new(DEAD_LETTERS_PENDING.clone()),
        Box::new(JOB_CYCLES_TOTAL.clone()),
        Box::new(JOB_ITEMS_TOTAL.clone()),
        Box::new(INSTANCE_POLLS_TOTAL.clone()),
        Box::new(REMOTE_ACTIVITIES_CACHED.clone()),
        Box::new(ERRORS_TOTAL.clone()),
    ];

    for collector in collectors {
        if let Err(e) = REGISTRY.register(collector) {
            tracing::debug!(error = %e, "Metric already registered");
        }
    }
}

/// Observe one delivery attempt outcome.
pub fn observe_delivery(status: &str, duration: std::time::Duration) {
    DELIVERIES_TOTAL.with_label_values(&[status]).inc();
    DELIVERY_DURATION_SECONDS
        .with_label_values(&[status])
        .observe(duration.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_metrics_is_idempotent() {
        init_metrics();
        init_metrics();
        DELIVERIES_TOTAL.with_label_values(&["success"]).inc();
        assert!(REGISTRY.gather().iter().any(|family| {
            family.get_name() == "rallypoint_deliveries_total"
        }));
    }
}
