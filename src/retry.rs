use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default policy applied to classes without an explicit entry.
pub const CLASS_DEFAULT: &str = "default";
/// Document-store writes and reads.
pub const CLASS_PERSIST: &str = "persist-document";
/// Outbound sends through the external delivery gateway.
pub const CLASS_DELIVERY: &str = "delivery-gateway";
/// Media fetches from the media store.
pub const CLASS_MEDIA_FETCH: &str = "media-fetch";
/// Aggressive policy for network-transient failures.
pub const CLASS_NETWORK: &str = "network-transient";
/// Specialized low-retry policy for corrupted or undecryptable media.
pub const CLASS_MEDIA_DECRYPT: &str = "media-decrypt";

/// Retry behavior for one operation class.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts = max_retries + 1.
    pub max_retries: u32,
    /// Base delay before the first retry.
    pub base_delay: Duration,
    /// Cap on the computed delay.
    pub max_delay: Duration,
    /// Exponential growth factor per attempt.
    pub backoff_multiplier: f64,
    /// Apply ±10% jitter to desynchronize concurrent retries.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A copy of this policy with a reduced retry budget, used for fallback
    /// operations so the worst-case total latency stays bounded.
    pub fn reduced(&self) -> Self {
        Self {
            max_retries: self.max_retries / 2,
            ..self.clone()
        }
    }
}

/// Immutable table mapping operation-class names to retry policies.
///
/// The executor looks policies up by class name and may swap to a more
/// specific entry mid-run when an error signature is recognized.
#[derive(Clone, Debug)]
pub struct RetryPolicyTable {
    policies: HashMap<String, RetryPolicy>,
    fallback: RetryPolicy,
}

impl Default for RetryPolicyTable {
    fn default() -> Self {
        let mut policies = HashMap::new();
        policies.insert(
            CLASS_PERSIST.to_string(),
            RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(10),
                backoff_multiplier: 2.0,
                jitter: true,
            },
        );
        policies.insert(
            CLASS_DELIVERY.to_string(),
            RetryPolicy {
                max_retries: 4,
                base_delay: Duration::from_millis(1000),
                max_delay: Duration::from_secs(30),
                backoff_multiplier: 2.0,
                jitter: true,
            },
        );
        policies.insert(
            CLASS_MEDIA_FETCH.to_string(),
            RetryPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(2000),
                max_delay: Duration::from_secs(20),
                backoff_multiplier: 2.0,
                jitter: true,
            },
        );
        policies.insert(
            CLASS_NETWORK.to_string(),
            RetryPolicy {
                max_retries: 5,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(5),
                backoff_multiplier: 2.0,
                jitter: true,
            },
        );
        policies.insert(
            CLASS_MEDIA_DECRYPT.to_string(),
            RetryPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(250),
                max_delay: Duration::from_millis(250),
                backoff_multiplier: 1.0,
                jitter: false,
            },
        );
        Self {
            policies,
            fallback: RetryPolicy::default(),
        }
    }
}

impl RetryPolicyTable {
    pub fn new(policies: HashMap<String, RetryPolicy>, fallback: RetryPolicy) -> Self {
        Self { policies, fallback }
    }

    /// Add or replace the policy for a class.
    pub fn with_policy(mut self, class: impl Into<String>, policy: RetryPolicy) -> Self {
        self.policies.insert(class.into(), policy);
        self
    }

    /// Look up the policy for a class, falling back to the default entry.
    pub fn get(&self, class: &str) -> &RetryPolicy {
        self.policies.get(class).unwrap_or(&self.fallback)
    }
}

/// Compute the delay before retry attempt `attempt` (1-based).
///
/// Formula: min(base_delay * backoff_multiplier^(attempt-1), max_delay),
/// with optional ±10% jitter. Monotonically non-decreasing in `attempt`
/// up to the cap (before jitter).
pub fn compute_retry_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let scaled =
        policy.base_delay.as_millis() as f64 * policy.backoff_multiplier.powi(exp);
    let capped = scaled.min(policy.max_delay.as_millis() as f64);

    let with_jitter = if policy.jitter {
        apply_jitter(capped)
    } else {
        capped
    };

    Duration::from_millis(with_jitter.max(0.0) as u64)
}

fn apply_jitter(delay_ms: f64) -> f64 {
    use rand::Rng;
    let factor = rand::thread_rng().gen_range(0.9..=1.1);
    delay_ms * factor
}
