use std::fmt::Display;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured category attached to an operation error at the raise site.
///
/// Downstream collaborators raise `OpError`s tagged with a kind; the
/// classifier maps kinds to retry decisions without inspecting message text.
/// `External` is the one escape hatch for errors crossing the boundary from
/// collaborators whose error shapes are uncontrolled; only those fall back to
/// substring pattern matching.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Missing or rejected credentials.
    Unauthorized,
    /// Malformed or semantically invalid input.
    Validation,
    /// Referenced entity does not exist.
    NotFound,
    /// Downstream call exceeded its deadline.
    Timeout,
    /// Connection dropped mid-operation.
    ConnectionReset,
    /// Dependency reported itself unavailable (5xx-class).
    Unavailable,
    /// Media payload failed integrity or decryption checks.
    MediaCorrupt,
    /// Media payload is in a format the pipeline cannot process.
    FormatUnsupported,
    /// Raised by an uncontrolled collaborator; classified by message pattern.
    External,
}

/// Error produced by one downstream operation attempt.
#[derive(Clone, Debug, Error)]
#[error("{kind:?}: {message}")]
pub struct OpError {
    kind: ErrorKind,
    message: String,
}

impl OpError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Wrap an error from a collaborator with uncontrolled error shapes.
    pub fn external(err: impl Display) -> Self {
        Self::new(ErrorKind::External, err.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Retry decision for a classified error.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Classification {
    /// Abort immediately; recorded as a breaker failure.
    NonRetryable,
    /// Retry per the active policy.
    Retryable,
    /// Network-transient; the next attempt runs with near-zero delay.
    ImmediateRetry,
    /// Swap the active retry policy for the named, more specific one.
    Reclassify(&'static str),
}

/// Maps error kinds (and boundary message patterns) to retry decisions.
#[derive(Clone, Debug)]
pub struct ErrorClassifier {
    /// Substring patterns applied only to `ErrorKind::External` messages.
    boundary_patterns: Vec<(String, Classification)>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self {
            boundary_patterns: vec![
                ("timed out".into(), Classification::ImmediateRetry),
                ("timeout".into(), Classification::ImmediateRetry),
                ("econnreset".into(), Classification::ImmediateRetry),
                ("socket hang up".into(), Classification::ImmediateRetry),
                ("rate limit".into(), Classification::Retryable),
                ("bad decrypt".into(), Classification::Reclassify(crate::retry::CLASS_MEDIA_DECRYPT)),
                ("unauthorized".into(), Classification::NonRetryable),
                ("forbidden".into(), Classification::NonRetryable),
                ("not found".into(), Classification::NonRetryable),
            ],
        }
    }
}

impl ErrorClassifier {
    pub fn new(boundary_patterns: Vec<(String, Classification)>) -> Self {
        Self { boundary_patterns }
    }

    /// Classify one attempt's error.
    pub fn classify(&self, err: &OpError) -> Classification {
        match err.kind() {
            ErrorKind::Unauthorized
            | ErrorKind::Validation
            | ErrorKind::NotFound
            | ErrorKind::FormatUnsupported => Classification::NonRetryable,
            ErrorKind::Timeout | ErrorKind::ConnectionReset => {
                Classification::ImmediateRetry
            }
            ErrorKind::Unavailable => Classification::Retryable,
            ErrorKind::MediaCorrupt => {
                Classification::Reclassify(crate::retry::CLASS_MEDIA_DECRYPT)
            }
            ErrorKind::External => self.classify_boundary(err.message()),
        }
    }

    fn classify_boundary(&self, message: &str) -> Classification {
        let lowered = message.to_lowercase();
        for (pattern, classification) in &self.boundary_patterns {
            if lowered.contains(pattern.as_str()) {
                return classification.clone();
            }
        }
        Classification::Retryable
    }
}

/// Final outcome raised by the resilient executor.
#[derive(Clone, Debug, Error)]
pub enum ExecuteError {
    /// Synthetic error raised without invoking the operation: the class's
    /// breaker currently judges the dependency unhealthy.
    #[error("circuit open for class '{class}', retry in {retry_after:?}")]
    CircuitOpen {
        class: String,
        retry_after: Duration,
    },

    /// The operation failed with a non-retryable error.
    #[error("operation class '{class}' aborted: {source}")]
    Aborted {
        class: String,
        #[source]
        source: OpError,
    },

    /// All retry attempts were consumed.
    #[error("operation class '{class}' exhausted {attempts} attempts: {source}")]
    RetriesExhausted {
        class: String,
        attempts: u32,
        #[source]
        source: OpError,
    },
}

impl ExecuteError {
    /// Whether the executor's retry budget was exhausted (as opposed to an
    /// immediate abort or an open circuit).
    pub fn is_exhausted(&self) -> bool {
        matches!(self, ExecuteError::RetriesExhausted { .. })
    }
}

/// Errors surfaced by the pipeline's own surface (intake and admin).
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unknown event kind '{0}'")]
    UnknownKind(String),

    #[error("pipeline is stopped")]
    Stopped,
}
