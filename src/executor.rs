use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::Instrument;

use crate::breaker::{Admission, CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::error::{Classification, ErrorClassifier, ExecuteError, OpError};
use crate::retry::{compute_retry_delay, RetryPolicy, RetryPolicyTable};
use crate::telemetry;

/// Delay used when a network-transient failure shortcuts the backoff.
const IMMEDIATE_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Executes downstream operations with per-class retry policies and circuit
/// breaking.
///
/// Handlers invoke the executor for every downstream call (document store,
/// delivery gateway, media store). The executor consults the class's breaker
/// before any attempt, retries per the class policy, and may reclassify to a
/// more specific policy mid-run once an error signature is recognized.
pub struct ResilientExecutor {
    policies: RetryPolicyTable,
    classifier: ErrorClassifier,
    breaker_config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl std::fmt::Debug for ResilientExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let breaker_count = self
            .breakers
            .try_lock()
            .map(|b| b.len())
            .unwrap_or_default();
        f.debug_struct("ResilientExecutor")
            .field("breaker_config", &self.breaker_config)
            .field("breaker_count", &breaker_count)
            .finish_non_exhaustive()
    }
}

impl Default for ResilientExecutor {
    fn default() -> Self {
        Self::new(
            RetryPolicyTable::default(),
            ErrorClassifier::default(),
            CircuitBreakerConfig::default(),
        )
    }
}

impl ResilientExecutor {
    pub fn new(
        policies: RetryPolicyTable,
        classifier: ErrorClassifier,
        breaker_config: CircuitBreakerConfig,
    ) -> Self {
        Self {
            policies,
            classifier,
            breaker_config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// The breaker guarding `class`, created on first use and shared by all
    /// callers of that class.
    pub async fn breaker(&self, class: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().await;
        Arc::clone(breakers.entry(class.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(class, self.breaker_config.clone()))
        }))
    }

    /// Current breaker states per class, for status reporting.
    pub async fn breaker_states(&self) -> HashMap<String, CircuitState> {
        let breakers = self.breakers.lock().await;
        let mut states = HashMap::with_capacity(breakers.len());
        for (class, breaker) in breakers.iter() {
            states.insert(class.clone(), breaker.state().await);
        }
        states
    }

    /// Run `operation` under the retry policy and circuit breaker for
    /// `class`, returning the operation's final error if unrecoverable.
    pub async fn execute<T, F, Fut>(
        &self,
        class: &str,
        operation: F,
    ) -> Result<T, ExecuteError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, OpError>>,
    {
        let policy = self.policies.get(class).clone();
        self.execute_with_policy(class, policy, operation).await
    }

    /// Run `primary` under the full class policy; if and only if its retries
    /// are exhausted, run `fallback` under a reduced budget for the same
    /// class, bounding worst-case total latency.
    pub async fn execute_with_fallback<T, F, FutF, G, FutG>(
        &self,
        class: &str,
        primary: F,
        fallback: G,
    ) -> Result<T, ExecuteError>
    where
        F: Fn() -> FutF,
        FutF: Future<Output = Result<T, OpError>>,
        G: Fn() -> FutG,
        FutG: Future<Output = Result<T, OpError>>,
    {
        match self.execute(class, primary).await {
            Ok(value) => Ok(value),
            Err(err) if err.is_exhausted() => {
                tracing::info!(class, "primary exhausted retries, running fallback");
                let policy = self.policies.get(class).reduced();
                self.execute_with_policy(class, policy, fallback).await
            }
            Err(err) => Err(err),
        }
    }

    async fn execute_with_policy<T, F, Fut>(
        &self,
        class: &str,
        policy: RetryPolicy,
        operation: F,
    ) -> Result<T, ExecuteError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, OpError>>,
    {
        let span = telemetry::execute_span(class);
        self.run_attempts(class, policy, operation)
            .instrument(span)
            .await
    }

    async fn run_attempts<T, F, Fut>(
        &self,
        class: &str,
        mut policy: RetryPolicy,
        operation: F,
    ) -> Result<T, ExecuteError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, OpError>>,
    {
        let breaker = self.breaker(class).await;

        if let Admission::Rejected { retry_after } = breaker.preflight().await {
            tracing::warn!(class, ?retry_after, "circuit open, failing fast");
            return Err(ExecuteError::CircuitOpen {
                class: class.to_string(),
                retry_after,
            });
        }

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => {
                    breaker.record_success().await;
                    return Ok(value);
                }
                Err(err) => {
                    let classification = self.classifier.classify(&err);
                    tracing::debug!(
                        class,
                        attempt,
                        error = %err,
                        ?classification,
                        "operation attempt failed"
                    );

                    if classification == Classification::NonRetryable {
                        breaker.record_failure().await;
                        return Err(ExecuteError::Aborted {
                            class: class.to_string(),
                            source: err,
                        });
                    }

                    if let Classification::Reclassify(target) = classification {
                        // Swap to the more specific policy for the rest of
                        // the run. The attempt counter carries over.
                        policy = self.policies.get(target).clone();
                    }

                    if attempt > policy.max_retries {
                        breaker.record_failure().await;
                        return Err(ExecuteError::RetriesExhausted {
                            class: class.to_string(),
                            attempts: attempt,
                            source: err,
                        });
                    }

                    let delay = if classification == Classification::ImmediateRetry
                        && attempt == 1
                    {
                        IMMEDIATE_RETRY_DELAY
                    } else {
                        compute_retry_delay(&policy, attempt)
                    };
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    fn fast_executor() -> ResilientExecutor {
        let policies = RetryPolicyTable::default()
            .with_policy(
                "test-class",
                RetryPolicy {
                    max_retries: 2,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(5),
                    backoff_multiplier: 2.0,
                    jitter: false,
                },
            )
            .with_policy(
                crate::retry::CLASS_MEDIA_DECRYPT,
                RetryPolicy {
                    max_retries: 1,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(1),
                    backoff_multiplier: 1.0,
                    jitter: false,
                },
            );
        ResilientExecutor::new(
            policies,
            ErrorClassifier::default(),
            CircuitBreakerConfig {
                failure_threshold: 3,
                recovery_timeout: Duration::from_millis(50),
                success_threshold: 1,
            },
        )
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let executor = fast_executor();
        let calls = AtomicU32::new(0);

        let result = executor
            .execute("test-class", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, OpError>(42) }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let executor = fast_executor();
        let calls = AtomicU32::new(0);

        let result = executor
            .execute("test-class", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(OpError::new(ErrorKind::Unavailable, "503"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_aborts_immediately() {
        let executor = fast_executor();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = executor
            .execute("test-class", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(OpError::new(ErrorKind::Validation, "bad payload")) }
            })
            .await;

        assert!(matches!(result, Err(ExecuteError::Aborted { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_raises_final_error() {
        let executor = fast_executor();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = executor
            .execute("test-class", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(OpError::new(ErrorKind::Unavailable, "503")) }
            })
            .await;

        match result {
            Err(ExecuteError::RetriesExhausted { attempts, .. }) => {
                assert_eq!(attempts, 3); // max_retries=2 -> 3 attempts
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_reclassification_drops_to_low_retry_policy() {
        let executor = fast_executor();
        let calls = AtomicU32::new(0);

        // MediaCorrupt reclassifies to the media-decrypt policy
        // (max_retries=1), so only the attempt in flight plus one retry run
        // even though the original class would allow more.
        let result: Result<(), _> = executor
            .execute("test-class", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(OpError::new(ErrorKind::MediaCorrupt, "hmac mismatch")) }
            })
            .await;

        assert!(matches!(
            result,
            Err(ExecuteError::RetriesExhausted { attempts: 2, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_immediate_retry_shortcuts_first_delay() {
        let executor = fast_executor();
        let calls = AtomicU32::new(0);

        let start = Instant::now();
        let result = executor
            .execute("test-class", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(OpError::new(ErrorKind::ConnectionReset, "reset"))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_circuit_opens_and_rejects_without_invoking() {
        let executor = fast_executor();
        let calls = AtomicU32::new(0);

        // Each exhausted run records one breaker failure; three trips it.
        for _ in 0..3 {
            let _ = executor
                .execute::<(), _, _>("test-class", || async {
                    Err(OpError::new(ErrorKind::Unavailable, "503"))
                })
                .await;
        }

        let result: Result<(), _> = executor
            .execute("test-class", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(ExecuteError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0, "operation must not run");
    }

    #[tokio::test]
    async fn test_circuit_recovers_through_half_open() {
        let executor = fast_executor();

        for _ in 0..3 {
            let _ = executor
                .execute::<(), _, _>("test-class", || async {
                    Err(OpError::new(ErrorKind::Unavailable, "503"))
                })
                .await;
        }
        assert_eq!(
            executor.breaker("test-class").await.state().await,
            CircuitState::Open
        );

        tokio::time::sleep(Duration::from_millis(60)).await;

        // success_threshold=1: a single successful probe closes the circuit.
        let result = executor
            .execute("test-class", || async { Ok::<_, OpError>(1) })
            .await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(
            executor.breaker("test-class").await.state().await,
            CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn test_fallback_runs_only_on_exhaustion() {
        let executor = fast_executor();
        let fallback_calls = AtomicU32::new(0);

        // Primary exhausts -> fallback runs and succeeds.
        let result = executor
            .execute_with_fallback(
                "test-class",
                || async { Err(OpError::new(ErrorKind::Unavailable, "503")) },
                || {
                    fallback_calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, OpError>("fallback") }
                },
            )
            .await;
        assert_eq!(result.unwrap(), "fallback");
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 1);

        // Primary aborts (non-retryable) -> fallback must not run.
        let executor = fast_executor();
        let fallback_calls = AtomicU32::new(0);
        let result: Result<(), _> = executor
            .execute_with_fallback(
                "test-class",
                || async { Err(OpError::new(ErrorKind::Validation, "bad")) },
                || {
                    fallback_calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                },
            )
            .await;
        assert!(matches!(result, Err(ExecuteError::Aborted { .. })));
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 0);

        // Primary succeeds -> fallback must not run.
        let executor = fast_executor();
        let fallback_calls = AtomicU32::new(0);
        let result = executor
            .execute_with_fallback(
                "test-class",
                || async { Ok::<_, OpError>(7) },
                || {
                    fallback_calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(7) }
                },
            )
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 0);
    }
}
