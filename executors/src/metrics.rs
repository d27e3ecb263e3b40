use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
};
use std::sync::{Arc, PoisonError, RwLock};

/// Keeper submission metrics
pub struct KeeperMetrics {
    pub submission_duration: HistogramVec,
    pub escalation_attempts: HistogramVec,
    pub outcomes: IntCounterVec,
}

impl KeeperMetrics {
    /// Create new keeper metrics with the provided registry
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let submission_duration = register_histogram_vec_with_registry!(
            HistogramOpts::new(
                "limit_keeper_submission_duration_seconds",
                "Time from picking up a work item to its outcome, including receipt waits"
            )
            .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
            &["mode", "network"],
            registry
        )?;

        let escalation_attempts = register_histogram_vec_with_registry!(
            HistogramOpts::new(
                "limit_keeper_escalation_attempts",
                "Broadcasts needed per included transaction"
            )
            .buckets(vec![1.0, 2.0, 3.0, 4.0, 5.0, 8.0]),
            &["network"],
            registry
        )?;

        let outcomes = register_int_counter_vec_with_registry!(
            Opts::new("limit_keeper_outcomes_total", "Work item outcomes by kind"),
            &["network", "action", "outcome"],
            registry
        )?;

        Ok(KeeperMetrics {
            submission_duration,
            escalation_attempts,
            outcomes,
        })
    }
}

lazy_static! {
    /// Default metrics registry (fallback if no external registry provided)
    static ref DEFAULT_KEEPER_METRICS_REGISTRY: Registry = Registry::new();

    static ref DEFAULT_KEEPER_METRICS: Option<Arc<KeeperMetrics>> =
        KeeperMetrics::new(&DEFAULT_KEEPER_METRICS_REGISTRY)
            .inspect_err(|e| tracing::error!(error = ?e, "Failed to register default keeper metrics"))
            .ok()
            .map(Arc::new);

    /// Global metrics instance - can be set by the binary crate or uses default
    static ref KEEPER_METRICS_INSTANCE: RwLock<Option<Arc<KeeperMetrics>>> = RwLock::new(None);
}

/// Initialize keeper metrics with a custom registry
/// This should be called once at application startup by the binary crate
pub fn initialize_metrics(metrics: KeeperMetrics) {
    let mut instance = KEEPER_METRICS_INSTANCE
        .write()
        .unwrap_or_else(PoisonError::into_inner);
    *instance = Some(Arc::new(metrics));
}

fn get_metrics() -> Option<Arc<KeeperMetrics>> {
    let instance = KEEPER_METRICS_INSTANCE
        .read()
        .unwrap_or_else(PoisonError::into_inner);
    instance
        .as_ref()
        .cloned()
        .or_else(|| DEFAULT_KEEPER_METRICS.clone())
}

/// Export metrics in Prometheus text format from `registry`
pub fn export_metrics(
    registry: &Registry,
) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Export metrics in Prometheus format from the default registry
pub fn export_default_metrics() -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    export_metrics(&DEFAULT_KEEPER_METRICS_REGISTRY)
}

pub fn record_submission_duration(mode: &str, network: &str, duration_seconds: f64) {
    if let Some(metrics) = get_metrics() {
        metrics
            .submission_duration
            .with_label_values(&[mode, network])
            .observe(duration_seconds);
    }
}

pub fn record_escalation_attempts(network: &str, attempts: u32) {
    if let Some(metrics) = get_metrics() {
        metrics
            .escalation_attempts
            .with_label_values(&[network])
            .observe(f64::from(attempts));
    }
}

pub fn record_outcome(network: &str, action: &str, outcome: &str) {
    if let Some(metrics) = get_metrics() {
        metrics
            .outcomes
            .with_label_values(&[network, action, outcome])
            .inc();
    }
}
