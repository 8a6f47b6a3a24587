use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::breaker::CircuitState;

/// Snapshot of queue occupancy and aggregate processing health.
#[derive(Clone, Debug, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    /// Monotonic count of jobs that reached a terminal state; never shrinks,
    /// even when old records are pruned.
    pub total_processed: u64,
    pub average_processing_time_ms: f64,
    pub throughput_per_minute: usize,
}

/// Extended snapshot for operators, adding scheduler and resilience state.
#[derive(Clone, Debug, Serialize)]
pub struct DetailedStatus {
    #[serde(flatten)]
    pub queue: QueueStats,
    pub backoff_multiplier: f64,
    pub rate_window_occupancy: usize,
    pub open_batch_windows: usize,
    pub pending_retry_timers: usize,
    pub throttled_drops: u64,
    /// (source, connection-state) pairs currently tracked by the throttle;
    /// stale pairs are pruned on each connection-event check.
    pub tracked_connection_pairs: usize,
    pub breaker_states: BTreeMap<String, CircuitState>,
}

/// Monotonic counters and derived rates for the pipeline.
///
/// Separate from the queue's terminal record maps on purpose: pruning old
/// records must not rewind totals or the running average.
#[derive(Debug, Default)]
pub struct StatsState {
    total_processed: u64,
    average_processing_time_ms: f64,
    throttled_drops: u64,
    /// Completion instants inside the trailing minute, for throughput.
    recent_completions: VecDeque<Instant>,
}

impl StatsState {
    const THROUGHPUT_WINDOW: Duration = Duration::from_secs(60);

    /// Fold one terminal outcome into the totals. The average uses the
    /// incremental form so no per-job history is needed.
    pub fn record_processed(&mut self, elapsed_ms: u64, now: Instant) {
        self.total_processed += 1;
        let n = self.total_processed as f64;
        self.average_processing_time_ms +=
            (elapsed_ms as f64 - self.average_processing_time_ms) / n;
        self.recent_completions.push_back(now);
        self.prune(now);
    }

    pub fn record_throttled_drop(&mut self) {
        self.throttled_drops += 1;
    }

    pub fn total_processed(&self) -> u64 {
        self.total_processed
    }

    pub fn average_processing_time_ms(&self) -> f64 {
        self.average_processing_time_ms
    }

    pub fn throttled_drops(&self) -> u64 {
        self.throttled_drops
    }

    /// Jobs that reached a terminal state in the trailing minute.
    pub fn throughput_per_minute(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.recent_completions.len()
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.recent_completions.front() {
            if now.saturating_duration_since(*front) > Self::THROUGHPUT_WINDOW {
                self.recent_completions.pop_front();
            } else {
                break;
            }
        }
    }
}
