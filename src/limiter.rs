use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Configuration for the adaptive dispatch rate limiter.
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    /// Trailing window over which dispatches are counted.
    pub window: Duration,
    /// Dispatches admitted per window at multiplier 1.0.
    pub max_dispatches: usize,
    /// Growth factor applied to the backoff multiplier on saturation.
    pub backoff_growth: f64,
    /// Cap on the backoff multiplier.
    pub max_backoff_multiplier: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(1),
            max_dispatches: 20,
            backoff_growth: 1.5,
            max_backoff_multiplier: 8.0,
        }
    }
}

/// Sliding-window rate limiter gating scheduler dispatches.
///
/// Tracks recent dispatch instants in a trailing window. Saturation grows a
/// capped backoff multiplier that divides the effective window capacity; the
/// multiplier resets to 1.0 after a clean pass through the available queue.
///
/// Not internally synchronized: lives inside the pipeline's single state
/// mutex, so only one mutator touches it at a time.
#[derive(Debug)]
pub struct DispatchLimiter {
    config: RateLimitConfig,
    timestamps: VecDeque<Instant>,
    backoff_multiplier: f64,
}

impl DispatchLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            timestamps: VecDeque::new(),
            backoff_multiplier: 1.0,
        }
    }

    /// Capacity after dividing by the current backoff multiplier, floored
    /// at one so dispatch can always eventually make progress.
    pub fn effective_capacity(&self) -> usize {
        ((self.config.max_dispatches as f64 / self.backoff_multiplier) as usize)
            .max(1)
    }

    /// Try to admit one dispatch at `now`. On saturation the backoff
    /// multiplier grows and the dispatch is refused.
    pub fn try_admit(&mut self, now: Instant) -> bool {
        self.prune(now);
        if self.timestamps.len() < self.effective_capacity() {
            self.timestamps.push_back(now);
            true
        } else {
            self.backoff_multiplier = (self.backoff_multiplier
                * self.config.backoff_growth)
                .min(self.config.max_backoff_multiplier);
            false
        }
    }

    /// Reset the multiplier after a pass that drained the ready queue
    /// without hitting saturation.
    pub fn reset_backoff(&mut self) {
        self.backoff_multiplier = 1.0;
    }

    /// How long until the oldest tracked dispatch leaves the window; used to
    /// schedule a delayed re-check instead of busy-polling.
    pub fn recheck_delay(&self, now: Instant) -> Duration {
        match self.timestamps.front() {
            Some(oldest) => {
                let age = now.saturating_duration_since(*oldest);
                self.config.window.saturating_sub(age)
            }
            None => Duration::from_millis(10),
        }
    }

    pub fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier
    }

    /// Dispatches currently inside the trailing window.
    pub fn occupancy(&self) -> usize {
        self.timestamps.len()
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.timestamps.front() {
            if now.saturating_duration_since(*front) > self.config.window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }
}
