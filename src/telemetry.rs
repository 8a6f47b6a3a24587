//! Tracing instrumentation for the event pipeline.
//!
//! Helper functions for creating spans and recording lifecycle events. The
//! record helpers also forward to the `metrics` module when that feature is
//! enabled; without it they only emit tracing events.

use tracing::{info_span, Span};

/// Span covering one dispatch of a job to the handler.
#[must_use]
pub fn dispatch_span(job_id: impl AsRef<str>, kind: impl AsRef<str>) -> Span {
    info_span!(
        "skua.dispatch",
        job_id = %job_id.as_ref(),
        event_kind = %kind.as_ref(),
    )
}

/// Span covering intake routing of a submitted event.
#[must_use]
pub fn submit_span(
    source_id: impl AsRef<str>,
    kind: impl AsRef<str>,
    priority: impl AsRef<str>,
) -> Span {
    info_span!(
        "skua.submit",
        source_id = %source_id.as_ref(),
        event_kind = %kind.as_ref(),
        priority = %priority.as_ref(),
    )
}

/// Span covering one resilient-executor operation run.
#[must_use]
pub fn execute_span(class: impl AsRef<str>) -> Span {
    info_span!("skua.execute", operation_class = %class.as_ref())
}

pub fn record_submitted(source_id: impl AsRef<str>, kind: impl AsRef<str>, route: &str) {
    tracing::debug!(
        source_id = %source_id.as_ref(),
        event_kind = %kind.as_ref(),
        route,
        "event submitted"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_submitted(kind.as_ref(), route);
}

pub fn record_completed(kind: impl AsRef<str>, status: &str, elapsed_ms: u64) {
    tracing::info!(
        event_kind = %kind.as_ref(),
        status,
        elapsed_ms,
        "job finished"
    );

    #[cfg(feature = "metrics")]
    {
        crate::metrics::record_completed(kind.as_ref(), status);
        crate::metrics::observe_job_duration(
            kind.as_ref(),
            status,
            elapsed_ms as f64 / 1000.0,
        );
    }
}

pub fn record_retry(kind: impl AsRef<str>, retry_count: u32, delay_ms: u64) {
    tracing::warn!(
        event_kind = %kind.as_ref(),
        retry_count,
        delay_ms,
        "job scheduled for retry"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_retry(kind.as_ref());
}

pub fn record_throttled(source_id: impl AsRef<str>, state: impl AsRef<str>) {
    tracing::debug!(
        source_id = %source_id.as_ref(),
        connection_state = %state.as_ref(),
        "connection event dropped by throttle"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_throttled(state.as_ref());
}

/// Forward a breaker state change to the metrics gauge. The breaker logs the
/// transition itself with full context, so only a debug event is emitted here.
pub fn record_breaker_transition(class: &str, state: &str) {
    tracing::debug!(operation_class = class, state, "circuit breaker transition");

    #[cfg(feature = "metrics")]
    crate::metrics::set_breaker_state(class, state);
}

pub fn set_queue_depth(pending: usize, processing: usize) {
    tracing::debug!(pending, processing, "queue depth updated");

    #[cfg(feature = "metrics")]
    {
        crate::metrics::set_queue_depth("pending", pending as f64);
        crate::metrics::set_queue_depth("processing", processing as f64);
    }
}
