//! Skua - priority-aware event dispatch for chat-gateway pipelines.
//!
//! A crate for absorbing bursty event streams from messaging gateways and
//! dispatching them to consumer handlers with bounded concurrency, per-kind
//! priorities, and resilient downstream execution.
//!
//! # Core Concepts
//!
//! - **Events and jobs**: Inbound gateway events carry an [`EventKind`] that
//!   fixes their priority and route. Accepted events become [`Job`]s owned by
//!   the pipeline until they reach a terminal state.
//!
//! - **Routing**: Conversation-critical kinds run inline on the submission
//!   path; coalescable kinds buffer into short batch windows; everything else
//!   enters the priority queue.
//!
//! - **Scheduler**: An event-driven pump drains the queue under a
//!   concurrency cap and an adaptive sliding-window rate limiter
//!   ([`DispatchLimiter`]).
//!
//! - **Resilience**: Handlers run downstream calls through the
//!   [`ResilientExecutor`], which applies per-class retry policies, error
//!   classification, and per-class circuit breakers.
//!
//! - **Observability**: Lifecycle events fan out on a broadcast bus
//!   ([`PipelineEventBus`]); [`EventPipeline::stats`] and
//!   [`EventPipeline::detailed_status`] expose queue and breaker snapshots.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use skua::*;
//! use std::sync::Arc;
//!
//! struct MyHandler;
//!
//! #[async_trait::async_trait]
//! impl EventHandler for MyHandler {
//!     async fn handle(&self, job: &Job, executor: &ResilientExecutor) -> Result<(), OpError> {
//!         executor
//!             .execute(CLASS_PERSIST, || async { save(job).await })
//!             .await
//!             .map_err(|e| OpError::external(e))?;
//!         Ok(())
//!     }
//! }
//!
//! let pipeline = EventPipelineBuilder::new(PipelineConfig::default())
//!     .with_handler(Arc::new(MyHandler))
//!     .build()?;
//! pipeline.start().await;
//! ```

/// Batch windows coalescing same-key events before they enter the queue.
pub mod batch;

/// Per-class circuit breakers guarding downstream dependencies.
pub mod breaker;

/// Pipeline configuration types.
pub mod config;

/// Error kinds, classification, and executor/pipeline error surfaces.
pub mod error;

/// Event kinds, priorities, routing, and the job type.
pub mod event;

/// Lifecycle event bus for pipeline observability.
pub mod events;

/// The resilient operation executor.
pub mod executor;

/// Adaptive sliding-window rate limiter gating dispatches.
pub mod limiter;

/// Prometheus metrics (behind the `metrics` feature).
pub mod metrics;

/// The in-process priority queue and job ownership ledger.
pub mod queue;

/// Per-class retry policies and backoff computation.
pub mod retry;

/// Aggregate counters and status snapshots.
pub mod stats;

/// Tracing span helpers and record functions.
pub mod telemetry;

/// Connection-event flap suppression.
pub mod throttle;

/// The pipeline runtime: intake, scheduler pump, admin surface, builder.
pub mod runtime;

pub use batch::{BatchAdmission, BatchConfig, BatchKey, BatchStage};
pub use breaker::{Admission, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::{PipelineConfig, RequeueBackoff};
pub use error::{
    Classification, ErrorClassifier, ErrorKind, ExecuteError, OpError, PipelineError,
};
pub use event::{
    DispatchRoute, EventKind, Job, JobId, JobPriority, JobState, SourceId,
};
pub use events::{PipelineEvent, PipelineEventBus};
pub use executor::ResilientExecutor;
pub use limiter::{DispatchLimiter, RateLimitConfig};
pub use queue::{CompletedRecord, DispatchQueue};
pub use retry::{
    compute_retry_delay, RetryPolicy, RetryPolicyTable, CLASS_DEFAULT, CLASS_DELIVERY,
    CLASS_MEDIA_DECRYPT, CLASS_MEDIA_FETCH, CLASS_NETWORK, CLASS_PERSIST,
};
pub use runtime::{EventHandler, EventPipeline, EventPipelineBuilder, ShutdownToken};
pub use stats::{DetailedStatus, QueueStats};
pub use throttle::{ConnectionThrottle, ThrottleConfig};
