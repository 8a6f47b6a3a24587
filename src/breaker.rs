use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;

use crate::telemetry;

/// Circuit breaker states, standard three-state pattern.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing fast; calls are rejected without invoking the operation.
    Open,
    /// Cool-down elapsed; probing whether the dependency recovered.
    HalfOpen,
}

/// Configuration shared by all per-class breakers.
#[derive(Clone, Debug)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the circuit open.
    pub failure_threshold: u32,
    /// Cool-down before an open circuit admits a half-open probe.
    pub recovery_timeout: Duration,
    /// Consecutive half-open successes required to close the circuit.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure_at: Option<Instant>,
}

/// Outcome of a preflight check before invoking an operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Admission {
    /// The call may proceed.
    Allowed,
    /// The circuit is open; fail fast. Carries the remaining cool-down.
    Rejected { retry_after: Duration },
}

/// Per-operation-class failure-isolation state machine.
///
/// One instance per class, shared by every caller of that class and mutated
/// only by the resilient executor. State lives behind a single mutex; all
/// transitions happen under one lock acquisition.
#[derive(Debug)]
pub struct CircuitBreaker {
    class: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(class: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            class: class.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_failure_at: None,
            }),
        }
    }

    /// The operation class this breaker guards.
    pub fn class(&self) -> &str {
        &self.class
    }

    /// Check whether a call may proceed, transitioning Open -> HalfOpen when
    /// the cool-down has elapsed. Exactly the first call after the cool-down
    /// is admitted as the half-open probe.
    pub async fn preflight(&self) -> Admission {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Admission::Allowed,
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.consecutive_successes = 0;
                    tracing::info!(
                        class = %self.class,
                        "circuit half-open, admitting probe"
                    );
                    telemetry::record_breaker_transition(&self.class, "half-open");
                    Admission::Allowed
                } else {
                    Admission::Rejected {
                        retry_after: self.config.recovery_timeout - elapsed,
                    }
                }
            }
        }
    }

    /// Record a successful call. Closes a half-open circuit once enough
    /// consecutive successes accumulate.
    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                    inner.last_failure_at = None;
                    tracing::info!(class = %self.class, "circuit closed");
                    telemetry::record_breaker_transition(&self.class, "closed");
                }
            }
            _ => {
                inner.consecutive_failures = 0;
            }
        }
    }

    /// Record a failed call. Opens the circuit at the failure threshold;
    /// a single half-open failure reopens it immediately.
    pub async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.last_failure_at = Some(Instant::now());
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.consecutive_successes = 0;
                tracing::warn!(class = %self.class, "half-open probe failed, circuit reopened");
                telemetry::record_breaker_transition(&self.class, "open");
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    tracing::warn!(
                        class = %self.class,
                        failures = inner.consecutive_failures,
                        "failure threshold reached, circuit opened"
                    );
                    telemetry::record_breaker_transition(&self.class, "open");
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Current state (Open is reported as-is even if the cool-down has
    /// elapsed; the transition happens on the next preflight).
    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    /// Force the breaker back to Closed, clearing all counters.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.last_failure_at = None;
    }
}
