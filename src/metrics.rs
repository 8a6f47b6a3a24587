//! Prometheus metrics for the event pipeline.
//!
//! Conditionally compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `skua_events_submitted_total` - Events accepted, by kind and route
//! - `skua_jobs_completed_total` - Jobs reaching a terminal state
//! - `skua_job_retries_total` - Delayed retries scheduled
//! - `skua_events_throttled_total` - Connection events dropped by the throttle
//!
//! ## Gauges
//! - `skua_queue_depth` - Current pending/processing occupancy
//! - `skua_breaker_state` - Circuit breaker state per operation class
//!
//! ## Histograms
//! - `skua_job_duration_seconds` - End-to-end job processing duration
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, CounterVec, GaugeVec, HistogramVec, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for pipeline metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static EVENTS_SUBMITTED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "skua_events_submitted_total",
        "Total number of events accepted by the pipeline",
    );
    CounterVec::new(opts, &["event_kind", "route"])
        .expect("skua_events_submitted_total metric creation failed")
});

pub static JOBS_COMPLETED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "skua_jobs_completed_total",
        "Total number of jobs reaching a terminal state",
    );
    CounterVec::new(opts, &["event_kind", "status"])
        .expect("skua_jobs_completed_total metric creation failed")
});

pub static JOB_RETRIES_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "skua_job_retries_total",
        "Total number of delayed retries scheduled",
    );
    CounterVec::new(opts, &["event_kind"])
        .expect("skua_job_retries_total metric creation failed")
});

pub static EVENTS_THROTTLED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "skua_events_throttled_total",
        "Total number of connection events dropped by the flap throttle",
    );
    CounterVec::new(opts, &["connection_state"])
        .expect("skua_events_throttled_total metric creation failed")
});

pub static QUEUE_DEPTH: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("skua_queue_depth", "Current queue occupancy");
    GaugeVec::new(opts, &["set"]).expect("skua_queue_depth metric creation failed")
});

/// Breaker state encoded as 0 = closed, 1 = half-open, 2 = open.
pub static BREAKER_STATE: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "skua_breaker_state",
        "Circuit breaker state per operation class (0=closed, 1=half-open, 2=open)",
    );
    GaugeVec::new(opts, &["operation_class"])
        .expect("skua_breaker_state metric creation failed")
});

pub static JOB_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.001, 2.0, 15).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "skua_job_duration_seconds",
        "End-to-end job processing duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["event_kind", "status"])
        .expect("skua_job_duration_seconds metric creation failed")
});

/// Register all metrics with the global registry. Idempotent.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(EVENTS_SUBMITTED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(JOBS_COMPLETED_TOTAL.clone()),
        Box::new(JOB_RETRIES_TOTAL.clone()),
        Box::new(EVENTS_THROTTLED_TOTAL.clone()),
        Box::new(QUEUE_DEPTH.clone()),
        Box::new(BREAKER_STATE.clone()),
        Box::new(JOB_DURATION_SECONDS.clone()),
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

pub fn record_submitted(event_kind: &str, route: &str) {
    EVENTS_SUBMITTED_TOTAL
        .with_label_values(&[event_kind, route])
        .inc();
}

pub fn record_completed(event_kind: &str, status: &str) {
    JOBS_COMPLETED_TOTAL
        .with_label_values(&[event_kind, status])
        .inc();
}

pub fn record_retry(event_kind: &str) {
    JOB_RETRIES_TOTAL.with_label_values(&[event_kind]).inc();
}

pub fn record_throttled(connection_state: &str) {
    EVENTS_THROTTLED_TOTAL
        .with_label_values(&[connection_state])
        .inc();
}

pub fn set_queue_depth(set: &str, depth: f64) {
    QUEUE_DEPTH.with_label_values(&[set]).set(depth);
}

pub fn set_breaker_state(operation_class: &str, state: &str) {
    let value = match state {
        "open" => 2.0,
        "half-open" => 1.0,
        _ => 0.0,
    };
    BREAKER_STATE
        .with_label_values(&[operation_class])
        .set(value);
}

pub fn observe_job_duration(event_kind: &str, status: &str, duration_secs: f64) {
    JOB_DURATION_SECONDS
        .with_label_values(&[event_kind, status])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
