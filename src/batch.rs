use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::event::{EventKind, Job};

/// Configuration for the batching stage.
#[derive(Clone, Debug)]
pub struct BatchConfig {
    /// How long a window stays open before flushing.
    pub window: Duration,
    /// Flush early once a window holds this many jobs.
    pub max_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(50),
            max_size: 10,
        }
    }
}

/// Key identifying one batch window: (kind, correlation key).
pub type BatchKey = (EventKind, String);

/// Ephemeral buffer coalescing same-key jobs; destroyed on flush.
#[derive(Debug)]
pub struct BatchWindow {
    /// Jobs in submission order.
    pub jobs: Vec<Job>,
    pub created_at: DateTime<Utc>,
    /// Retained handle for the window's flush timer so shutdown can cancel
    /// it cleanly.
    pub flush_timer: Option<JoinHandle<()>>,
}

impl BatchWindow {
    fn new() -> Self {
        Self {
            jobs: Vec::new(),
            created_at: Utc::now(),
            flush_timer: None,
        }
    }
}

/// Result of adding a job to the batch stage.
#[derive(Debug)]
pub enum BatchAdmission {
    /// First job for this key: the caller must arm a flush timer for it.
    Opened(BatchKey),
    /// Added to an existing window; its timer keeps running.
    Joined,
    /// The addition hit the size threshold; the window's jobs are returned
    /// and the caller must cancel its timer.
    Full(Vec<Job>),
}

/// Short-lived per-key buffers for kinds that are safe to coalesce.
///
/// Lives inside the pipeline's state mutex; timer arming and cancellation
/// happen outside the lock in the pipeline.
#[derive(Debug, Default)]
pub struct BatchStage {
    config: BatchConfig,
    windows: HashMap<BatchKey, BatchWindow>,
}

impl BatchStage {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            windows: HashMap::new(),
        }
    }

    /// Buffer a job under its (kind, correlation key).
    pub fn add(&mut self, job: Job) -> BatchAdmission {
        let key = (
            job.kind,
            job.batch_key.clone().unwrap_or_else(|| "uncorrelated".into()),
        );
        let window = self.windows.entry(key.clone()).or_insert_with(BatchWindow::new);
        let opened = window.jobs.is_empty() && window.flush_timer.is_none();
        window.jobs.push(job);

        if window.jobs.len() >= self.config.max_size {
            let window = self.windows.remove(&key).expect("window just inserted");
            if let Some(timer) = window.flush_timer {
                timer.abort();
            }
            BatchAdmission::Full(window.jobs)
        } else if opened {
            BatchAdmission::Opened(key)
        } else {
            BatchAdmission::Joined
        }
    }

    /// Record the flush timer handle for a freshly opened window.
    pub fn arm_timer(&mut self, key: &BatchKey, handle: JoinHandle<()>) {
        if let Some(window) = self.windows.get_mut(key) {
            window.flush_timer = Some(handle);
        } else {
            // Window already flushed by size before the timer was recorded.
            handle.abort();
        }
    }

    /// Flush one window when its timer fires. Returns the buffered jobs in
    /// submission order, or None if the window was already flushed by size.
    pub fn flush(&mut self, key: &BatchKey) -> Option<Vec<Job>> {
        self.windows.remove(key).map(|window| window.jobs)
    }

    /// Drop all windows, aborting their timers. Buffered jobs are returned
    /// so the caller can decide whether to queue or discard them.
    pub fn drain_all(&mut self) -> Vec<Job> {
        let mut jobs = Vec::new();
        for (_, window) in self.windows.drain() {
            if let Some(timer) = window.flush_timer {
                timer.abort();
            }
            jobs.extend(window.jobs);
        }
        jobs
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    pub fn window(&self) -> Duration {
        self.config.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SourceId;
    use serde_json::json;

    fn presence(jid: &str) -> Job {
        Job::new(
            EventKind::PresenceUpdate,
            SourceId::from("instance-1"),
            json!({"jid": jid, "presence": "composing"}),
            3,
        )
    }

    #[test]
    fn test_first_job_opens_window() {
        let mut stage = BatchStage::new(BatchConfig::default());
        match stage.add(presence("a@g.us")) {
            BatchAdmission::Opened((kind, key)) => {
                assert_eq!(kind, EventKind::PresenceUpdate);
                assert_eq!(key, "a@g.us");
            }
            other => panic!("expected Opened, got {other:?}"),
        }
        assert_eq!(stage.window_count(), 1);
    }

    #[test]
    fn test_same_key_joins_distinct_keys_open() {
        let mut stage = BatchStage::new(BatchConfig::default());
        assert!(matches!(
            stage.add(presence("a@g.us")),
            BatchAdmission::Opened(_)
        ));
        assert!(matches!(stage.add(presence("a@g.us")), BatchAdmission::Joined));
        assert!(matches!(
            stage.add(presence("b@g.us")),
            BatchAdmission::Opened(_)
        ));
        assert_eq!(stage.window_count(), 2);
    }

    #[test]
    fn test_size_threshold_flushes_in_submission_order() {
        let mut stage = BatchStage::new(BatchConfig {
            window: Duration::from_secs(10),
            max_size: 3,
        });

        let jobs: Vec<Job> = (0..3).map(|_| presence("a@g.us")).collect();
        let ids: Vec<_> = jobs.iter().map(|j| j.id).collect();

        let mut jobs = jobs.into_iter();
        stage.add(jobs.next().unwrap());
        stage.add(jobs.next().unwrap());
        match stage.add(jobs.next().unwrap()) {
            BatchAdmission::Full(flushed) => {
                let flushed_ids: Vec<_> = flushed.iter().map(|j| j.id).collect();
                assert_eq!(flushed_ids, ids);
            }
            other => panic!("expected Full, got {other:?}"),
        }
        assert_eq!(stage.window_count(), 0);
    }

    #[test]
    fn test_timer_flush_returns_buffered_jobs() {
        let mut stage = BatchStage::new(BatchConfig::default());
        let key = match stage.add(presence("a@g.us")) {
            BatchAdmission::Opened(key) => key,
            other => panic!("expected Opened, got {other:?}"),
        };
        stage.add(presence("a@g.us"));

        let flushed = stage.flush(&key).unwrap();
        assert_eq!(flushed.len(), 2);
        // A second flush for the same key is a no-op.
        assert!(stage.flush(&key).is_none());
    }
}
