//! Prometheus metrics for sortie.
//!
//! Compiled only with the `metrics` feature.
//!
//! # Metrics
//!
//! ## Counters
//! - `sortie_items_total` - Items reaching a terminal state, by status
//! - `sortie_teardown_failures_total` - Worker directories left behind
//! - `sortie_error_reports_total` - Error reports, by delivery result
//!
//! ## Gauges
//! - `sortie_lease_valid` - 1 while the cached lease is valid
//!
//! ## Histograms
//! - `sortie_item_duration_seconds` - Time from item start to terminal state
#![cfg(feature = "metrics")]

use prometheus::{
    CounterVec, Gauge, HistogramVec, IntCounter, Opts, Registry, exponential_buckets,
};
use std::sync::LazyLock;

/// Global Prometheus registry for sortie metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Items reaching a terminal state.
///
/// Labels:
/// - `status`: `confirmed` or `failed`
pub static ITEMS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("sortie_items_total", "Work items reaching a terminal state");
    CounterVec::new(opts, &["status"]).expect("sortie_items_total metric creation failed")
});

pub static ITEM_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.05, 2.0, 12).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "sortie_item_duration_seconds",
        "Work item duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["status"])
        .expect("sortie_item_duration_seconds metric creation failed")
});

pub static TEARDOWN_FAILURES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "sortie_teardown_failures_total",
        "Worker storage directories that could not be removed",
    )
    .expect("sortie_teardown_failures_total metric creation failed")
});

pub static LEASE_VALID: LazyLock<Gauge> = LazyLock::new(|| {
    Gauge::new("sortie_lease_valid", "1 while the cached license lease is valid")
        .expect("sortie_lease_valid metric creation failed")
});

/// Labels:
/// - `result`: `delivered` or `dropped`
pub static ERROR_REPORTS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("sortie_error_reports_total", "Error reports sent to the collector");
    CounterVec::new(opts, &["result"]).expect("sortie_error_reports_total metric creation failed")
});

/// Register all collectors with [`REGISTRY`]. Idempotent.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(ITEMS_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(ITEM_DURATION_SECONDS.clone()),
        Box::new(TEARDOWN_FAILURES_TOTAL.clone()),
        Box::new(LEASE_VALID.clone()),
        Box::new(ERROR_REPORTS_TOTAL.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_item(status: &str, duration_secs: f64) {
    ITEMS_TOTAL.with_label_values(&[status]).inc();
    ITEM_DURATION_SECONDS
        .with_label_values(&[status])
        .observe(duration_secs);
}

pub fn record_teardown_failure() {
    TEARDOWN_FAILURES_TOTAL.inc();
}

pub fn set_lease_valid(valid: bool) {
    LEASE_VALID.set(if valid { 1.0 } else { 0.0 });
}

pub fn record_error_report(result: &str) {
    ERROR_REPORTS_TOTAL.with_label_values(&[result]).inc();
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
