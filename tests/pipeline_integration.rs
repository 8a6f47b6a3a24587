//! End-to-end pipeline tests: routing, ordering, batching, retries, and
//! accounting through the public surface.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::timeout;

use skua::{
    BatchConfig, ErrorKind, EventHandler, EventKind, EventPipeline,
    EventPipelineBuilder, Job, OpError, PipelineConfig, RequeueBackoff,
    ResilientExecutor, SourceId,
};

/// Handler that records the kinds it sees, optionally sleeping on one kind
/// and failing another.
struct RecordingHandler {
    seen: Mutex<Vec<EventKind>>,
    slow_kind: Option<(EventKind, Duration)>,
    fail_kind: Option<EventKind>,
}

impl RecordingHandler {
    fn new() -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            slow_kind: None,
            fail_kind: None,
        }
    }

    fn slow(kind: EventKind, delay: Duration) -> Self {
        Self {
            slow_kind: Some((kind, delay)),
            ..Self::new()
        }
    }

    fn failing(kind: EventKind) -> Self {
        Self {
            fail_kind: Some(kind),
            ..Self::new()
        }
    }

    async fn seen(&self) -> Vec<EventKind> {
        self.seen.lock().await.clone()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(
        &self,
        job: &Job,
        _executor: &ResilientExecutor,
    ) -> Result<(), OpError> {
        if let Some((kind, delay)) = self.slow_kind {
            if kind == job.kind {
                tokio::time::sleep(delay).await;
            }
        }
        self.seen.lock().await.push(job.kind);
        if self.fail_kind == Some(job.kind) {
            return Err(OpError::new(ErrorKind::Unavailable, "downstream 503"));
        }
        Ok(())
    }
}

fn fast_config() -> PipelineConfig {
    PipelineConfig {
        max_concurrency: 1,
        default_max_retries: 1,
        batch: BatchConfig {
            window: Duration::from_millis(50),
            max_size: 10,
        },
        requeue_backoff: RequeueBackoff {
            base: Duration::from_millis(10),
            cap: Duration::from_millis(50),
            multiplier: 2.0,
        },
        ..Default::default()
    }
}

fn build(config: PipelineConfig, handler: Arc<RecordingHandler>) -> EventPipeline {
    EventPipelineBuilder::new(config)
        .with_handler(handler)
        .build()
        .expect("pipeline builds")
}

async fn wait_idle(pipeline: &EventPipeline) {
    timeout(Duration::from_secs(5), async {
        loop {
            if pipeline.is_idle().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("pipeline did not drain in time");
}

#[tokio::test]
async fn test_fast_path_never_enters_queue() {
    let handler = Arc::new(RecordingHandler::new());
    let pipeline = build(fast_config(), handler.clone());
    // Pump deliberately not started: inline kinds must complete anyway.

    for _ in 0..3 {
        pipeline
            .submit(
                EventKind::NewMessage,
                SourceId::from("instance-1"),
                json!({"id": "m"}),
            )
            .await
            .unwrap();
    }

    let stats = pipeline.stats().await;
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.total_processed, 3);
    assert_eq!(handler.seen().await.len(), 3);
}

#[tokio::test]
async fn test_queued_jobs_dispatch_in_priority_order() {
    let handler = Arc::new(RecordingHandler::new());
    let pipeline = build(fast_config(), handler.clone());

    // Enqueue in reverse priority order before the pump runs.
    pipeline
        .submit(
            EventKind::ConnectionStateChange,
            SourceId::from("instance-1"),
            json!({"state": "open"}),
        )
        .await
        .unwrap();
    pipeline
        .submit(
            EventKind::ChatUpdate,
            SourceId::from("instance-1"),
            json!({"chatId": "c1"}),
        )
        .await
        .unwrap();
    pipeline
        .submit(
            EventKind::MessageStatusUpdate,
            SourceId::from("instance-1"),
            json!({"id": "m1"}),
        )
        .await
        .unwrap();

    pipeline.start().await;
    wait_idle(&pipeline).await;

    assert_eq!(
        handler.seen().await,
        vec![
            EventKind::MessageStatusUpdate,
            EventKind::ChatUpdate,
            EventKind::ConnectionStateChange,
        ]
    );
    pipeline.stop().await;
}

#[tokio::test]
async fn test_presence_burst_coalesces_into_one_flush() {
    let handler = Arc::new(RecordingHandler::new());
    let pipeline = build(fast_config(), handler.clone());
    pipeline.start().await;

    for i in 0..5 {
        pipeline
            .submit(
                EventKind::PresenceUpdate,
                SourceId::from("instance-1"),
                json!({"jid": "room@g.us", "seq": i}),
            )
            .await
            .unwrap();
    }

    // Inside the window nothing has been dispatched yet.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(handler.seen().await.is_empty());
    let status = pipeline.detailed_status().await;
    assert_eq!(status.open_batch_windows, 1);

    wait_idle(&pipeline).await;
    let seen = handler.seen().await;
    assert_eq!(seen.len(), 5);
    assert!(seen.iter().all(|k| *k == EventKind::PresenceUpdate));

    let stats = pipeline.stats().await;
    assert_eq!(stats.completed, 5);
    pipeline.stop().await;
}

#[tokio::test]
async fn test_inline_completes_while_queue_is_busy() {
    let handler = Arc::new(RecordingHandler::slow(
        EventKind::ChatUpdate,
        Duration::from_millis(150),
    ));
    let pipeline = build(fast_config(), handler.clone());
    pipeline.start().await;

    // Occupy the single scheduler slot with a slow queued job.
    pipeline
        .submit(
            EventKind::ChatUpdate,
            SourceId::from("instance-1"),
            json!({"chatId": "c1"}),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    // The inline job runs on the submit path, not in the scheduler slot,
    // so it finishes while the queued job is still sleeping.
    pipeline
        .submit(
            EventKind::NewMessage,
            SourceId::from("instance-1"),
            json!({"id": "m1"}),
        )
        .await
        .unwrap();

    let seen = handler.seen().await;
    assert_eq!(seen, vec![EventKind::NewMessage]);

    wait_idle(&pipeline).await;
    assert_eq!(
        handler.seen().await,
        vec![EventKind::NewMessage, EventKind::ChatUpdate]
    );
    pipeline.stop().await;
}

#[tokio::test]
async fn test_failed_job_retries_then_lands_in_failed_set() {
    let handler = Arc::new(RecordingHandler::failing(EventKind::ChatUpdate));
    let pipeline = build(fast_config(), handler.clone());
    pipeline.start().await;

    let mut events = pipeline.subscribe();
    pipeline
        .submit(
            EventKind::ChatUpdate,
            SourceId::from("instance-1"),
            json!({"chatId": "c1"}),
        )
        .await
        .unwrap();

    wait_idle(&pipeline).await;

    // max_retries=1: first run plus one delayed retry.
    assert_eq!(handler.seen().await.len(), 2);
    let stats = pipeline.stats().await;
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 0);
    assert_eq!(stats.total_processed, 1);

    let mut saw_retry = false;
    let mut saw_failure = false;
    while let Ok(event) = events.try_recv() {
        match event {
            skua::PipelineEvent::Retried { .. } => saw_retry = true,
            skua::PipelineEvent::Failed { .. } => saw_failure = true,
            _ => {}
        }
    }
    assert!(saw_retry, "expected a retry event");
    assert!(saw_failure, "expected a terminal failure event");
    pipeline.stop().await;
}

#[tokio::test]
async fn test_retry_failed_jobs_resets_budget_and_requeues() {
    let handler = Arc::new(RecordingHandler::failing(EventKind::ChatUpdate));
    let pipeline = build(fast_config(), handler.clone());
    pipeline.start().await;

    pipeline
        .submit(
            EventKind::ChatUpdate,
            SourceId::from("instance-1"),
            json!({"chatId": "c1"}),
        )
        .await
        .unwrap();
    wait_idle(&pipeline).await;
    assert_eq!(pipeline.stats().await.failed, 1);

    let requeued = pipeline.retry_failed_jobs().await;
    assert_eq!(requeued, 1);
    wait_idle(&pipeline).await;

    // The job got a fresh budget: two more attempts, still failing.
    assert_eq!(handler.seen().await.len(), 4);
    assert_eq!(pipeline.stats().await.failed, 1);
    pipeline.stop().await;
}

#[tokio::test]
async fn test_accounting_identity_and_pruning() {
    let handler = Arc::new(RecordingHandler::new());
    let pipeline = build(fast_config(), handler);
    pipeline.start().await;

    for i in 0..4 {
        pipeline
            .submit(
                EventKind::MessageStatusUpdate,
                SourceId::from("instance-1"),
                json!({"id": format!("m{i}")}),
            )
            .await
            .unwrap();
    }
    pipeline
        .submit(
            EventKind::NewMessage,
            SourceId::from("instance-1"),
            json!({"id": "inline"}),
        )
        .await
        .unwrap();
    wait_idle(&pipeline).await;

    let stats = pipeline.stats().await;
    assert_eq!(
        stats.pending + stats.processing + stats.completed + stats.failed,
        5
    );
    assert_eq!(stats.total_processed, 5);
    assert!(stats.average_processing_time_ms >= 0.0);
    assert_eq!(stats.throughput_per_minute, 5);

    // Pruning shrinks the record maps but never the monotonic totals.
    tokio::time::sleep(Duration::from_millis(5)).await;
    let removed = pipeline.clear_old_jobs(0).await;
    assert_eq!(removed, 5);
    let stats = pipeline.stats().await;
    assert_eq!(stats.completed, 0);
    assert_eq!(stats.total_processed, 5);
    pipeline.stop().await;
}

#[tokio::test]
async fn test_breaker_state_surfaces_in_detailed_status() {
    struct BreakerHandler;

    #[async_trait]
    impl EventHandler for BreakerHandler {
        async fn handle(
            &self,
            _job: &Job,
            executor: &ResilientExecutor,
        ) -> Result<(), OpError> {
            executor
                .execute::<(), _, _>("flaky-dependency", || async {
                    Err(OpError::new(ErrorKind::Unavailable, "503"))
                })
                .await
                .map_err(OpError::external)
        }
    }

    let pipeline = EventPipelineBuilder::new(fast_config())
        .with_handler(Arc::new(BreakerHandler))
        .with_policies(
            skua::RetryPolicyTable::default().with_policy(
                "flaky-dependency",
                skua::RetryPolicy {
                    max_retries: 0,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(1),
                    backoff_multiplier: 1.0,
                    jitter: false,
                },
            ),
        )
        .build()
        .unwrap();
    pipeline.start().await;

    // Enough terminal failures to trip the default breaker threshold (5).
    for i in 0..3 {
        pipeline
            .submit(
                EventKind::ChatUpdate,
                SourceId::from("instance-1"),
                json!({"chatId": format!("c{i}")}),
            )
            .await
            .unwrap();
    }
    wait_idle(&pipeline).await;

    let status = pipeline.detailed_status().await;
    let state = status
        .breaker_states
        .get("flaky-dependency")
        .expect("breaker exists for the exercised class");
    // 3 jobs x 2 attempts each = 6 breaker failures, past the threshold.
    assert_eq!(*state, skua::CircuitState::Open);
    pipeline.stop().await;
}

#[tokio::test]
async fn test_stop_cancels_pending_retry_timers() {
    let mut config = fast_config();
    config.requeue_backoff.base = Duration::from_secs(60);
    config.requeue_backoff.cap = Duration::from_secs(60);
    let handler = Arc::new(RecordingHandler::failing(EventKind::ChatUpdate));
    let pipeline = build(config, handler.clone());
    pipeline.start().await;

    pipeline
        .submit(
            EventKind::ChatUpdate,
            SourceId::from("instance-1"),
            json!({"chatId": "c1"}),
        )
        .await
        .unwrap();

    // Wait for the first attempt to fail and arm its long retry timer.
    timeout(Duration::from_secs(5), async {
        loop {
            if pipeline.detailed_status().await.pending_retry_timers == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("retry timer never armed");

    // stop() must return promptly despite the 60s timer, and the job must
    // reach a terminal state rather than vanish with the aborted timer.
    timeout(Duration::from_secs(2), pipeline.stop())
        .await
        .expect("stop blocked on a retry timer");
    assert_eq!(handler.seen().await.len(), 1);
    assert_eq!(pipeline.stats().await.failed, 1);
}

#[tokio::test]
async fn test_job_awaiting_retry_stays_accounted() {
    let mut config = fast_config();
    config.requeue_backoff.base = Duration::from_secs(60);
    config.requeue_backoff.cap = Duration::from_secs(60);
    let handler = Arc::new(RecordingHandler::failing(EventKind::ChatUpdate));
    let pipeline = build(config, handler);
    pipeline.start().await;

    pipeline
        .submit(
            EventKind::ChatUpdate,
            SourceId::from("instance-1"),
            json!({"chatId": "c1"}),
        )
        .await
        .unwrap();

    timeout(Duration::from_secs(5), async {
        loop {
            if pipeline.detailed_status().await.pending_retry_timers == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("retry timer never armed");

    // Mid-backoff the job counts as pending; the accounting identity still
    // covers it exactly once.
    let stats = pipeline.stats().await;
    assert_eq!(stats.pending, 1);
    assert_eq!(
        stats.pending + stats.processing + stats.completed + stats.failed,
        1
    );

    pipeline.stop().await;
    let stats = pipeline.stats().await;
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.failed, 1);
}

#[tokio::test]
async fn test_inline_failure_reports_actual_inline_retries() {
    // Retryable inline failure: the single inline retry runs and the
    // terminal event reports it.
    let handler = Arc::new(RecordingHandler::failing(EventKind::NewMessage));
    let pipeline = build(fast_config(), handler.clone());
    let mut events = pipeline.subscribe();

    pipeline
        .submit(
            EventKind::NewMessage,
            SourceId::from("instance-1"),
            json!({"id": "m1"}),
        )
        .await
        .unwrap();
    assert_eq!(handler.seen().await.len(), 2);
    assert_eq!(failed_retry_count(&mut events), Some(1));

    // Non-retryable inline failure: no retry runs, and the event says so.
    struct RejectingHandler;

    #[async_trait]
    impl EventHandler for RejectingHandler {
        async fn handle(
            &self,
            _job: &Job,
            _executor: &ResilientExecutor,
        ) -> Result<(), OpError> {
            Err(OpError::new(ErrorKind::Validation, "malformed payload"))
        }
    }

    let pipeline = EventPipelineBuilder::new(fast_config())
        .with_handler(Arc::new(RejectingHandler))
        .build()
        .unwrap();
    let mut events = pipeline.subscribe();

    pipeline
        .submit(
            EventKind::NewMessage,
            SourceId::from("instance-1"),
            json!({"id": "m2"}),
        )
        .await
        .unwrap();
    assert_eq!(failed_retry_count(&mut events), Some(0));
}

fn failed_retry_count(
    events: &mut tokio::sync::broadcast::Receiver<skua::PipelineEvent>,
) -> Option<u32> {
    let mut count = None;
    while let Ok(event) = events.try_recv() {
        if let skua::PipelineEvent::Failed { retry_count, .. } = event {
            count = Some(retry_count);
        }
    }
    count
}

#[tokio::test]
async fn test_stale_throttle_entries_pruned_on_next_check() {
    let mut config = fast_config();
    config.throttle.window = Duration::from_millis(40);
    let handler = Arc::new(RecordingHandler::new());
    let pipeline = build(config, handler);

    pipeline
        .submit(
            EventKind::ConnectionStateChange,
            SourceId::from("instance-a"),
            json!({"state": "close"}),
        )
        .await
        .unwrap();
    assert_eq!(pipeline.detailed_status().await.tracked_connection_pairs, 1);

    // Past the window, the next check drops the stale instance-a entry.
    tokio::time::sleep(Duration::from_millis(60)).await;
    pipeline
        .submit(
            EventKind::ConnectionStateChange,
            SourceId::from("instance-b"),
            json!({"state": "close"}),
        )
        .await
        .unwrap();
    assert_eq!(pipeline.detailed_status().await.tracked_connection_pairs, 1);
}
