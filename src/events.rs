use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::event::{DispatchRoute, EventKind, JobId, JobPriority, SourceId};

/// Lifecycle event emitted as jobs move through the pipeline.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum PipelineEvent {
    /// Event accepted and routed.
    Submitted {
        job_id: JobId,
        kind: EventKind,
        source_id: SourceId,
        priority: JobPriority,
        route: DispatchRoute,
    },
    /// Job buffered into a batch window.
    Batched {
        job_id: JobId,
        kind: EventKind,
        batch_key: String,
    },
    /// Job handed to the handler by the scheduler.
    Dispatched {
        job_id: JobId,
        kind: EventKind,
        priority: JobPriority,
    },
    /// Job finished successfully.
    Completed {
        job_id: JobId,
        kind: EventKind,
        elapsed_ms: u64,
    },
    /// Job requeued after a failure, with a backoff delay.
    Retried {
        job_id: JobId,
        kind: EventKind,
        retry_count: u32,
        delay_ms: u64,
    },
    /// Job exhausted its budget and moved to the failed set.
    Failed {
        job_id: JobId,
        kind: EventKind,
        retry_count: u32,
    },
    /// Connection event dropped by the flap throttle.
    Throttled {
        source_id: SourceId,
        state: String,
        at: DateTime<Utc>,
    },
}

/// In-process fan-out bus for pipeline lifecycle events.
///
/// Built on a tokio broadcast channel: publishing never blocks, and a
/// subscriber that falls behind sees `RecvError::Lagged` rather than
/// stalling the scheduler.
pub struct PipelineEventBus {
    sender: broadcast::Sender<PipelineEvent>,
    capacity: usize,
}

impl std::fmt::Debug for PipelineEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl PipelineEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    /// Publish to all subscribers. Silently dropped when nobody listens.
    pub fn publish(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for PipelineEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
