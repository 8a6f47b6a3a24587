use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a pipeline job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    /// Create a new job ID using UUID v7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the gateway instance an event originated from.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SourceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SourceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Inbound event kinds accepted by the pipeline.
///
/// Priority and dispatch routing are derived purely from the kind.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    /// A new inbound chat message. Conversation-critical, handled inline.
    NewMessage,
    /// A chat created or updated by the gateway. Handled inline.
    ChatUpsert,
    /// Delivery/read receipt for a previously sent message.
    MessageStatusUpdate,
    /// Metadata change on an existing chat.
    ChatUpdate,
    /// Gateway connection state transition. Throttled per source.
    ConnectionStateChange,
    /// Contact presence change. Coalesced into batch windows.
    PresenceUpdate,
}

/// How a kind travels through the pipeline.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DispatchRoute {
    /// Executed synchronously on the caller's path, bypassing the queue.
    Inline,
    /// Inserted into the priority queue.
    Queued,
    /// Buffered per correlation key before entering the queue as a group.
    Batched,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::NewMessage => "new-message",
            EventKind::ChatUpsert => "chat-upsert",
            EventKind::MessageStatusUpdate => "message-status-update",
            EventKind::ChatUpdate => "chat-update",
            EventKind::ConnectionStateChange => "connection-state-change",
            EventKind::PresenceUpdate => "presence-update",
        }
    }

    /// Static priority for this kind. Fixed at enqueue time; no aging.
    pub fn priority(&self) -> JobPriority {
        match self {
            EventKind::NewMessage => JobPriority::P0,
            EventKind::ChatUpsert => JobPriority::P0,
            EventKind::MessageStatusUpdate => JobPriority::P1,
            EventKind::ChatUpdate => JobPriority::P2,
            EventKind::ConnectionStateChange => JobPriority::P3,
            EventKind::PresenceUpdate => JobPriority::P4,
        }
    }

    pub fn route(&self) -> DispatchRoute {
        match self {
            EventKind::NewMessage | EventKind::ChatUpsert => {
                DispatchRoute::Inline
            }
            EventKind::PresenceUpdate => DispatchRoute::Batched,
            _ => DispatchRoute::Queued,
        }
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = crate::error::PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new-message" => Ok(EventKind::NewMessage),
            "chat-upsert" => Ok(EventKind::ChatUpsert),
            "message-status-update" => Ok(EventKind::MessageStatusUpdate),
            "chat-update" => Ok(EventKind::ChatUpdate),
            "connection-state-change" => Ok(EventKind::ConnectionStateChange),
            "presence-update" => Ok(EventKind::PresenceUpdate),
            other => Err(crate::error::PipelineError::UnknownKind(
                other.to_string(),
            )),
        }
    }
}

/// Job priority levels, P0 highest. Lower ordinal dequeues first.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
pub enum JobPriority {
    P0 = 0,
    P1 = 1,
    P2 = 2,
    P3 = 3,
    P4 = 4,
}

impl JobPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPriority::P0 => "P0",
            JobPriority::P1 => "P1",
            JobPriority::P2 => "P2",
            JobPriority::P3 => "P3",
            JobPriority::P4 => "P4",
        }
    }
}

impl Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle state of a job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// One unit of queued work derived from an inbound event.
///
/// Owned exclusively by the queue until a terminal state; `retry_count` is
/// mutated only by the scheduler on failure.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: EventKind,
    pub source_id: SourceId,
    pub payload: serde_json::Value,
    pub arrived_at: DateTime<Utc>,
    pub priority: JobPriority,
    pub retry_count: u16,
    pub max_retries: u16,
    pub state: JobState,
    /// Correlation key for kinds that coalesce into batch windows.
    pub batch_key: Option<String>,
}

impl Job {
    pub fn new(
        kind: EventKind,
        source_id: SourceId,
        payload: serde_json::Value,
        max_retries: u16,
    ) -> Self {
        let batch_key = match kind.route() {
            DispatchRoute::Batched => Some(batch_key_for(&payload)),
            _ => None,
        };
        Self {
            id: JobId::new(),
            kind,
            source_id,
            payload,
            arrived_at: Utc::now(),
            priority: kind.priority(),
            retry_count: 0,
            max_retries,
            state: JobState::Pending,
            batch_key,
        }
    }
}

/// Derive the batch correlation key from the event payload.
///
/// Falls back to a shared bucket when the payload carries no recognizable
/// correlation field.
pub fn batch_key_for(payload: &serde_json::Value) -> String {
    for field in ["chatId", "jid", "participant", "id"] {
        if let Some(value) = payload.get(field).and_then(|v| v.as_str()) {
            return value.to_string();
        }
    }
    "uncorrelated".to_string()
}
