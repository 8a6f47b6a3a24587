use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::event::{Job, JobId, JobState};

/// Record kept for a job that completed successfully, retained so operators
/// can inspect recent history; pruned by `clear_old_jobs`.
#[derive(Clone, Debug)]
pub struct CompletedRecord {
    pub kind: crate::event::EventKind,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

/// In-process priority queue and job ownership ledger.
///
/// A job is in exactly one of the pending queue, the delayed set, the
/// processing set, or a terminal set at any time. All mutation happens under
/// the pipeline's state mutex (single-mutator discipline).
#[derive(Debug, Default)]
pub struct DispatchQueue {
    /// Pending jobs, kept sorted by priority (stable: FIFO within a
    /// priority) via ordered insertion.
    pending: Vec<Job>,
    /// Jobs waiting out a retry backoff delay. Owned here so they stay
    /// accounted between failure and re-insertion.
    delayed: HashMap<JobId, Job>,
    /// Jobs currently being processed, keyed by id.
    processing: HashMap<JobId, Job>,
    /// Terminal successes; record only, the job itself is dropped.
    completed: HashMap<JobId, CompletedRecord>,
    /// Terminal failures; full jobs retained so an operator can requeue.
    failed: HashMap<JobId, Job>,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert by priority using binary search: O(log n) to find the slot,
    /// giving O(1) dequeue from the front. `partition_point` lands after the
    /// last equal-priority entry, preserving submission order within a
    /// priority.
    pub fn insert(&mut self, mut job: Job) {
        job.state = JobState::Pending;
        let idx = self
            .pending
            .partition_point(|queued| queued.priority <= job.priority);
        self.pending.insert(idx, job);
    }

    /// Insert a group of jobs flushed from a batch window, preserving their
    /// submission order.
    pub fn insert_group(&mut self, jobs: Vec<Job>) {
        for job in jobs {
            self.insert(job);
        }
    }

    /// Take the highest-priority ready job and move it to the processing set.
    pub fn take_next(&mut self) -> Option<Job> {
        if self.pending.is_empty() {
            return None;
        }
        let mut job = self.pending.remove(0);
        job.state = JobState::Processing;
        self.processing.insert(job.id, job.clone());
        Some(job)
    }

    /// Move a processing job to the completed set.
    pub fn complete(&mut self, job_id: JobId, elapsed_ms: u64) -> Option<Job> {
        let job = self.processing.remove(&job_id)?;
        self.completed.insert(
            job_id,
            CompletedRecord {
                kind: job.kind,
                finished_at: Utc::now(),
                elapsed_ms,
            },
        );
        Some(job)
    }

    /// Move a processing job into the delayed set for a backoff retry. The
    /// job stays owned (and counted) here until `release_delayed` re-inserts
    /// it or `fail_all_delayed` retires it at shutdown.
    pub fn defer_for_retry(&mut self, job_id: JobId) -> Option<&Job> {
        let mut job = self.processing.remove(&job_id)?;
        job.retry_count += 1;
        job.state = JobState::Pending;
        self.delayed.insert(job_id, job);
        self.delayed.get(&job_id)
    }

    /// Move a delayed job back into the pending queue once its backoff timer
    /// fires. Returns false if the job is no longer delayed.
    pub fn release_delayed(&mut self, job_id: JobId) -> bool {
        match self.delayed.remove(&job_id) {
            Some(job) => {
                self.insert(job);
                true
            }
            None => false,
        }
    }

    /// Retire every delayed job into the failed set. Called at shutdown after
    /// the backoff timers are aborted, so no job vanishes without a terminal
    /// state. Returns how many were retired.
    pub fn fail_all_delayed(&mut self) -> usize {
        let delayed: Vec<Job> = self.delayed.drain().map(|(_, job)| job).collect();
        let count = delayed.len();
        for mut job in delayed {
            job.state = JobState::Failed;
            self.failed.insert(job.id, job);
        }
        count
    }

    /// Move a processing job to the durable failed set. Never auto-retried;
    /// only `requeue_failed` brings it back.
    pub fn fail(&mut self, job_id: JobId) -> Option<&Job> {
        let mut job = self.processing.remove(&job_id)?;
        job.state = JobState::Failed;
        self.failed.insert(job_id, job);
        self.failed.get(&job_id)
    }

    /// Record a terminal state for a fast-path job that never entered the
    /// queue, so terminal sets still account for it.
    pub fn record_inline_terminal(&mut self, job: Job, elapsed_ms: u64, success: bool) {
        if success {
            self.completed.insert(
                job.id,
                CompletedRecord {
                    kind: job.kind,
                    finished_at: Utc::now(),
                    elapsed_ms,
                },
            );
        } else {
            let mut job = job;
            job.state = JobState::Failed;
            self.failed.insert(job.id, job);
        }
    }

    /// Drain the failed set back into the pending queue with reset retry
    /// budgets. Returns the number of requeued jobs.
    pub fn requeue_failed(&mut self) -> usize {
        let failed: Vec<Job> = self.failed.drain().map(|(_, job)| job).collect();
        let count = failed.len();
        for mut job in failed {
            job.retry_count = 0;
            self.insert(job);
        }
        count
    }

    /// Prune terminal records older than the cutoff. Returns how many were
    /// removed. Counters derived from these maps shrink accordingly; the
    /// monotonic totals in the stats state are unaffected.
    pub fn clear_older_than(&mut self, older_than_hours: u32) -> usize {
        let cutoff = Utc::now() - Duration::hours(older_than_hours as i64);
        let before = self.completed.len() + self.failed.len();
        self.completed.retain(|_, record| record.finished_at >= cutoff);
        self.failed.retain(|_, job| job.arrived_at >= cutoff);
        before - self.completed.len() - self.failed.len()
    }

    /// Jobs ready for dispatch right now (excludes delayed jobs).
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Jobs parked behind a retry backoff timer.
    pub fn delayed_len(&self) -> usize {
        self.delayed.len()
    }

    pub fn processing_len(&self) -> usize {
        self.processing.len()
    }

    pub fn completed_len(&self) -> usize {
        self.completed.len()
    }

    pub fn failed_len(&self) -> usize {
        self.failed.len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.delayed.is_empty() && self.processing.is_empty()
    }
}
