use std::time::Duration;

use crate::batch::BatchConfig;
use crate::limiter::RateLimitConfig;
use crate::throttle::ThrottleConfig;

/// Backoff schedule for queued jobs that fail and get requeued.
#[derive(Clone, Debug)]
pub struct RequeueBackoff {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound on the computed delay.
    pub cap: Duration,
    /// Exponential growth factor per prior attempt.
    pub multiplier: f64,
}

impl Default for RequeueBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RequeueBackoff {
    /// Delay before re-inserting a job that has already failed
    /// `retry_count` times.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exp = self.multiplier.powi(retry_count.min(16) as i32);
        let millis = (self.base.as_millis() as f64 * exp) as u64;
        Duration::from_millis(millis).min(self.cap)
    }
}

/// Top-level pipeline configuration.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Jobs the scheduler may have in flight at once.
    pub max_concurrency: usize,
    /// Per-queue retry budget for jobs without an explicit one.
    pub default_max_retries: u16,
    pub rate_limit: RateLimitConfig,
    pub batch: BatchConfig,
    pub throttle: ThrottleConfig,
    pub requeue_backoff: RequeueBackoff,
    /// Capacity of the lifecycle event broadcast channel.
    pub event_bus_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            default_max_retries: 3,
            rate_limit: RateLimitConfig::default(),
            batch: BatchConfig::default(),
            throttle: ThrottleConfig::default(),
            requeue_backoff: RequeueBackoff::default(),
            event_bus_capacity: 1024,
        }
    }
}
