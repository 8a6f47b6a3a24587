use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::batch::{BatchAdmission, BatchKey, BatchStage};
use crate::config::PipelineConfig;
use crate::error::{Classification, ErrorClassifier, OpError, PipelineError};
use crate::event::{DispatchRoute, EventKind, Job, JobId, SourceId};
use crate::events::{PipelineEvent, PipelineEventBus};
use crate::executor::ResilientExecutor;
use crate::limiter::DispatchLimiter;
use crate::queue::DispatchQueue;
use crate::stats::{DetailedStatus, QueueStats, StatsState};
use crate::telemetry;
use crate::throttle::ConnectionThrottle;

/// Token for signaling graceful shutdown to pipeline tasks.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.inner.notify.notified().await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumer-provided processing logic for dispatched jobs.
///
/// Implementations route every downstream call through the executor so
/// retries and circuit breaking apply uniformly.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(
        &self,
        job: &Job,
        executor: &ResilientExecutor,
    ) -> Result<(), OpError>;
}

/// Mutable pipeline state; everything behind one mutex so a single mutator
/// touches the queue, limiter, batch windows, throttle, and stats at a time.
struct DispatchState {
    queue: DispatchQueue,
    limiter: DispatchLimiter,
    batches: BatchStage,
    throttle: ConnectionThrottle,
    stats: StatsState,
    /// Live backoff timers for jobs awaiting a delayed retry. Retained so
    /// `stop` can cancel them instead of leaking sleeps.
    retry_timers: HashMap<JobId, JoinHandle<()>>,
    inflight: usize,
}

pub(crate) struct PipelineInner {
    config: PipelineConfig,
    handler: Arc<dyn EventHandler>,
    executor: Arc<ResilientExecutor>,
    classifier: ErrorClassifier,
    state: Mutex<DispatchState>,
    wake: Notify,
    events: PipelineEventBus,
    shutdown: ShutdownToken,
}

/// Priority-aware event dispatch pipeline.
///
/// Accepts gateway events through [`submit`](EventPipeline::submit), runs
/// conversation-critical kinds inline, coalesces batchable kinds, and pumps
/// everything else through a rate-limited priority queue onto the consumer's
/// [`EventHandler`].
pub struct EventPipeline {
    inner: Arc<PipelineInner>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for EventPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPipeline")
            .field("config", &self.inner.config)
            .field("shutdown_cancelled", &self.inner.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl EventPipeline {
    /// Create a pipeline with default executor wiring. Use
    /// [`EventPipelineBuilder`](crate::runtime::EventPipelineBuilder) to
    /// customize retry policies, classification, or breaker thresholds.
    pub fn new(config: PipelineConfig, handler: Arc<dyn EventHandler>) -> Self {
        Self::from_parts(
            config,
            handler,
            Arc::new(ResilientExecutor::default()),
            ErrorClassifier::default(),
        )
    }

    pub(crate) fn from_parts(
        config: PipelineConfig,
        handler: Arc<dyn EventHandler>,
        executor: Arc<ResilientExecutor>,
        classifier: ErrorClassifier,
    ) -> Self {
        let state = DispatchState {
            queue: DispatchQueue::new(),
            limiter: DispatchLimiter::new(config.rate_limit.clone()),
            batches: BatchStage::new(config.batch.clone()),
            throttle: ConnectionThrottle::new(config.throttle.clone()),
            stats: StatsState::default(),
            retry_timers: HashMap::new(),
            inflight: 0,
        };
        let events = PipelineEventBus::new(config.event_bus_capacity);
        Self {
            inner: Arc::new(PipelineInner {
                config,
                handler,
                executor,
                classifier,
                state: Mutex::new(state),
                wake: Notify::new(),
                events,
                shutdown: ShutdownToken::new(),
            }),
            pump: Mutex::new(None),
        }
    }

    /// Spawn the scheduler pump. Idempotent; a second call is a no-op.
    pub async fn start(&self) {
        let mut pump = self.pump.lock().await;
        if pump.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *pump = Some(tokio::spawn(pump_loop(inner)));
        tracing::info!("pipeline started");
    }

    /// Accept one inbound event and route it by kind.
    ///
    /// Returns the job id. For inline kinds the handler has already run (and
    /// possibly failed terminally) by the time this returns; for throttled
    /// connection events the returned id is a no-op, counted in
    /// [`detailed_status`](Self::detailed_status).
    pub async fn submit(
        &self,
        kind: EventKind,
        source_id: SourceId,
        payload: serde_json::Value,
    ) -> Result<JobId, PipelineError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(PipelineError::Stopped);
        }

        let span = telemetry::submit_span(
            source_id.as_str(),
            kind.as_str(),
            kind.priority().as_str(),
        );
        async {
            if kind == EventKind::ConnectionStateChange {
                if let Some(id) = self.throttle_connection_event(&source_id, &payload).await {
                    return Ok(id);
                }
            }

            let job = Job::new(
                kind,
                source_id.clone(),
                payload,
                self.inner.config.default_max_retries,
            );
            let route = kind.route();
            telemetry::record_submitted(
                source_id.as_str(),
                kind.as_str(),
                route_label(route),
            );
            self.inner.events.publish(PipelineEvent::Submitted {
                job_id: job.id,
                kind,
                source_id,
                priority: job.priority,
                route,
            });

            match route {
                DispatchRoute::Inline => self.dispatch_inline(job).await,
                DispatchRoute::Batched => Ok(self.buffer_into_batch(job).await),
                DispatchRoute::Queued => {
                    let id = job.id;
                    let mut state = self.inner.state.lock().await;
                    state.queue.insert(job);
                    telemetry::set_queue_depth(
                        state.queue.pending_len(),
                        state.queue.processing_len(),
                    );
                    drop(state);
                    self.inner.wake.notify_one();
                    Ok(id)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Fast path: run the handler on the caller's path with one inline
    /// retry, never touching the pending queue.
    async fn dispatch_inline(&self, job: Job) -> Result<JobId, PipelineError> {
        let id = job.id;
        let kind = job.kind;
        let started = Instant::now();

        let mut inline_retries: u32 = 0;
        let mut result = self.inner.handler.handle(&job, &self.inner.executor).await;
        if let Err(err) = &result {
            if self.inner.classifier.classify(err) != Classification::NonRetryable {
                tracing::debug!(job_id = %id, error = %err, "inline attempt failed, retrying once");
                inline_retries = 1;
                result = self.inner.handler.handle(&job, &self.inner.executor).await;
            }
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let success = result.is_ok();
        {
            let mut state = self.inner.state.lock().await;
            state.queue.record_inline_terminal(job, elapsed_ms, success);
            state.stats.record_processed(elapsed_ms, Instant::now());
        }

        match result {
            Ok(()) => {
                telemetry::record_completed(kind.as_str(), "success", elapsed_ms);
                self.inner.events.publish(PipelineEvent::Completed {
                    job_id: id,
                    kind,
                    elapsed_ms,
                });
            }
            Err(err) => {
                tracing::warn!(job_id = %id, error = %err, "inline job failed terminally");
                telemetry::record_completed(kind.as_str(), "failed", elapsed_ms);
                self.inner.events.publish(PipelineEvent::Failed {
                    job_id: id,
                    kind,
                    retry_count: inline_retries,
                });
            }
        }
        Ok(id)
    }

    /// Drop flapping connection events before they reach the queue. Returns
    /// a no-op job id when the event was suppressed.
    async fn throttle_connection_event(
        &self,
        source_id: &SourceId,
        payload: &serde_json::Value,
    ) -> Option<JobId> {
        let connection_state = payload
            .get("state")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();

        let now = Instant::now();
        let mut state = self.inner.state.lock().await;
        state.throttle.prune(now);
        if !state.throttle.should_drop(source_id, &connection_state, now) {
            return None;
        }
        state.stats.record_throttled_drop();
        drop(state);

        telemetry::record_throttled(source_id.as_str(), &connection_state);
        self.inner.events.publish(PipelineEvent::Throttled {
            source_id: source_id.clone(),
            state: connection_state,
            at: Utc::now(),
        });
        Some(JobId::new())
    }

    /// Buffer a batchable job; opens a flush timer for fresh windows, or
    /// queues the whole group immediately when the size threshold is hit.
    async fn buffer_into_batch(&self, job: Job) -> JobId {
        let id = job.id;
        let kind = job.kind;
        let batch_key = job.batch_key.clone().unwrap_or_else(|| "uncorrelated".into());

        let mut state = self.inner.state.lock().await;
        match state.batches.add(job) {
            BatchAdmission::Opened(key) => {
                let handle = spawn_flush_timer(
                    Arc::clone(&self.inner),
                    key.clone(),
                    state.batches.window(),
                );
                state.batches.arm_timer(&key, handle);
                drop(state);
                self.inner.events.publish(PipelineEvent::Batched {
                    job_id: id,
                    kind,
                    batch_key,
                });
            }
            BatchAdmission::Joined => {
                drop(state);
                self.inner.events.publish(PipelineEvent::Batched {
                    job_id: id,
                    kind,
                    batch_key,
                });
            }
            BatchAdmission::Full(jobs) => {
                state.queue.insert_group(jobs);
                drop(state);
                self.inner.wake.notify_one();
            }
        }
        id
    }

    /// Snapshot of queue occupancy and aggregate health.
    pub async fn stats(&self) -> QueueStats {
        let mut state = self.inner.state.lock().await;
        snapshot_stats(&mut state)
    }

    /// Extended operator snapshot including scheduler and breaker state.
    pub async fn detailed_status(&self) -> DetailedStatus {
        let (
            queue,
            backoff_multiplier,
            rate_window_occupancy,
            open_batch_windows,
            pending_retry_timers,
            throttled_drops,
            tracked_connection_pairs,
        ) = {
            let mut state = self.inner.state.lock().await;
            (
                snapshot_stats(&mut state),
                state.limiter.backoff_multiplier(),
                state.limiter.occupancy(),
                state.batches.window_count(),
                state.retry_timers.len(),
                state.stats.throttled_drops(),
                state.throttle.tracked_pairs(),
            )
        };
        let breaker_states: BTreeMap<_, _> = self
            .inner
            .executor
            .breaker_states()
            .await
            .into_iter()
            .collect();
        DetailedStatus {
            queue,
            backoff_multiplier,
            rate_window_occupancy,
            open_batch_windows,
            pending_retry_timers,
            throttled_drops,
            tracked_connection_pairs,
            breaker_states,
        }
    }

    /// Requeue every job in the failed set with a fresh retry budget.
    /// Returns how many were requeued.
    pub async fn retry_failed_jobs(&self) -> usize {
        let count = {
            let mut state = self.inner.state.lock().await;
            state.queue.requeue_failed()
        };
        if count > 0 {
            tracing::info!(count, "requeued failed jobs");
            self.inner.wake.notify_one();
        }
        count
    }

    /// Prune terminal records older than the cutoff. Monotonic totals are
    /// unaffected. Returns how many records were removed.
    pub async fn clear_old_jobs(&self, older_than_hours: u32) -> usize {
        let mut state = self.inner.state.lock().await;
        let removed = state.queue.clear_older_than(older_than_hours);
        if removed > 0 {
            tracing::info!(removed, older_than_hours, "pruned old job records");
        }
        removed
    }

    /// Stop the pipeline: cancel retry and batch timers, shut the pump down,
    /// and reject further submissions.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();

        {
            let mut state = self.inner.state.lock().await;
            for (_, handle) in state.retry_timers.drain() {
                handle.abort();
            }
            let retired = state.queue.fail_all_delayed();
            if retired > 0 {
                tracing::info!(
                    count = retired,
                    "jobs awaiting retry moved to failed set at shutdown"
                );
            }
            let dropped = state.batches.drain_all();
            if !dropped.is_empty() {
                tracing::info!(
                    count = dropped.len(),
                    "discarded buffered batch jobs at shutdown"
                );
            }
        }

        if let Some(handle) = self.pump.lock().await.take() {
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    tracing::warn!("pump task failed during shutdown: {err}");
                }
            }
        }
        tracing::info!("pipeline stopped");
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.inner.events.subscribe()
    }

    /// The executor shared with handlers, for direct resilient calls
    /// outside the queue.
    pub fn executor(&self) -> Arc<ResilientExecutor> {
        Arc::clone(&self.inner.executor)
    }

    /// Whether no work is pending, buffered, or in flight.
    pub async fn is_idle(&self) -> bool {
        let state = self.inner.state.lock().await;
        state.queue.is_idle()
            && state.inflight == 0
            && state.batches.window_count() == 0
            && state.retry_timers.is_empty()
    }
}

fn route_label(route: DispatchRoute) -> &'static str {
    match route {
        DispatchRoute::Inline => "inline",
        DispatchRoute::Queued => "queued",
        DispatchRoute::Batched => "batched",
    }
}

fn snapshot_stats(state: &mut DispatchState) -> QueueStats {
    QueueStats {
        // Jobs waiting out a retry backoff are still pending work.
        pending: state.queue.pending_len() + state.queue.delayed_len(),
        processing: state.queue.processing_len(),
        completed: state.queue.completed_len(),
        failed: state.queue.failed_len(),
        total_processed: state.stats.total_processed(),
        average_processing_time_ms: state.stats.average_processing_time_ms(),
        throughput_per_minute: state.stats.throughput_per_minute(Instant::now()),
    }
}

fn spawn_flush_timer(
    inner: Arc<PipelineInner>,
    key: BatchKey,
    window: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(window).await;
        let mut state = inner.state.lock().await;
        if let Some(jobs) = state.batches.flush(&key) {
            tracing::debug!(
                kind = %key.0,
                batch_key = %key.1,
                count = jobs.len(),
                "batch window flushed"
            );
            state.queue.insert_group(jobs);
            drop(state);
            inner.wake.notify_one();
        }
    })
}

/// Event-driven scheduler pump.
///
/// Sleeps until woken by a submission, a freed slot, a retry timer, or a
/// batch flush; drains the queue while concurrency and the rate limiter
/// allow. On limiter saturation it arms a delayed re-check instead of
/// busy-polling.
async fn pump_loop(inner: Arc<PipelineInner>) {
    loop {
        if inner.shutdown.is_cancelled() {
            tracing::info!("pump shutting down");
            break;
        }

        let mut recheck: Option<Duration> = None;
        loop {
            let mut state = inner.state.lock().await;
            if state.inflight >= inner.config.max_concurrency {
                break;
            }
            if state.queue.pending_len() == 0 {
                // Clean pass: the ready queue drained without saturating.
                state.limiter.reset_backoff();
                break;
            }
            let now = Instant::now();
            if !state.limiter.try_admit(now) {
                recheck = Some(state.limiter.recheck_delay(now));
                break;
            }
            let job = match state.queue.take_next() {
                Some(job) => job,
                None => break,
            };
            state.inflight += 1;
            telemetry::set_queue_depth(
                state.queue.pending_len(),
                state.queue.processing_len(),
            );
            drop(state);

            inner.events.publish(PipelineEvent::Dispatched {
                job_id: job.id,
                kind: job.kind,
                priority: job.priority,
            });
            tokio::spawn(process_job(Arc::clone(&inner), job));
        }

        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = inner.wake.notified() => {}
            _ = async {
                match recheck {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => std::future::pending::<()>().await,
                }
            } => {}
        }
    }
}

async fn process_job(inner: Arc<PipelineInner>, job: Job) {
    let span = telemetry::dispatch_span(job.id.to_string(), job.kind.as_str());
    let started = Instant::now();
    let result = inner
        .handler
        .handle(&job, &inner.executor)
        .instrument(span)
        .await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let mut state = inner.state.lock().await;
    state.inflight -= 1;

    match result {
        Ok(()) => {
            state.queue.complete(job.id, elapsed_ms);
            state.stats.record_processed(elapsed_ms, Instant::now());
            drop(state);
            telemetry::record_completed(job.kind.as_str(), "success", elapsed_ms);
            inner.events.publish(PipelineEvent::Completed {
                job_id: job.id,
                kind: job.kind,
                elapsed_ms,
            });
        }
        Err(err) if job.retry_count < job.max_retries => {
            let deferred = state
                .queue
                .defer_for_retry(job.id)
                .map(|j| (j.id, j.kind, u32::from(j.retry_count)));
            if let Some((job_id, kind, retry_count)) = deferred {
                let delay = inner
                    .config
                    .requeue_backoff
                    .delay_for(u32::from(job.retry_count));
                let handle = spawn_retry_timer(Arc::clone(&inner), job_id, delay);
                state.retry_timers.insert(job_id, handle);
                drop(state);

                tracing::warn!(
                    job_id = %job_id,
                    error = %err,
                    retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "job failed, retry scheduled"
                );
                telemetry::record_retry(kind.as_str(), retry_count, delay.as_millis() as u64);
                inner.events.publish(PipelineEvent::Retried {
                    job_id,
                    kind,
                    retry_count,
                    delay_ms: delay.as_millis() as u64,
                });
            }
        }
        Err(err) => {
            state.queue.fail(job.id);
            state.stats.record_processed(elapsed_ms, Instant::now());
            drop(state);
            tracing::error!(
                job_id = %job.id,
                error = %err,
                retry_count = job.retry_count,
                "job exhausted retries, moved to failed set"
            );
            telemetry::record_completed(job.kind.as_str(), "failed", elapsed_ms);
            inner.events.publish(PipelineEvent::Failed {
                job_id: job.id,
                kind: job.kind,
                retry_count: u32::from(job.retry_count),
            });
        }
    }

    inner.wake.notify_one();
}

fn spawn_retry_timer(
    inner: Arc<PipelineInner>,
    job_id: JobId,
    delay: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let mut state = inner.state.lock().await;
        state.retry_timers.remove(&job_id);
        if state.queue.release_delayed(job_id) {
            drop(state);
            inner.wake.notify_one();
        }
    })
}
