//! Error types for `logfold`.
//!
//! Errors are layered the same way the engine is:
//!
//! - **HandlerError**: raised by an event handler's `validate` or `project`
//! - **LogError**: raised by a durable log adapter
//! - **EngineError**: everything a caller of the engine can observe
//!
//! Per-record failures (`UnknownType`, `PostValidation`, `Projection`) are
//! local to the record that caused them. `OrderingViolation` is the only error
//! that stops the consumption loop.
//!
//! # Example
//!
//! ```rust,ignore
//! match engine.submit("UserAdded", &props).await {
//!     Ok(event) => info!(position = ?event.position, "user added"),
//!     Err(EngineError::PreValidation(reason)) => {
//!         // Rejected locally, nothing was appended
//!         display_error(&reason);
//!     }
//!     Err(EngineError::PostValidation { position, source }) => {
//!         // Appended, but stale by the time it was delivered
//!         warn!(%position, %source, "user rejected");
//!     }
//!     Err(e) => return Err(e),
//! }
//! ```

use crate::types::{EventTypeName, Position};
use thiserror::Error;

/// A failure reported by an event handler.
///
/// The message is surfaced verbatim to the submitting caller and to signal
/// subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    /// Creates a handler error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the message the handler failed with.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(format!("Invalid event props: {err}"))
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// Errors raised by a durable log adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogError {
    /// The record could not be stored.
    #[error("Append failed: {0}")]
    AppendFailed(String),

    /// A subscription could not be established.
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),

    /// A stored record could not be read back.
    #[error("Corrupt record at position {position}: {reason}")]
    CorruptRecord {
        /// Position of the unreadable record
        position: Position,
        /// Why the record could not be read
        reason: String,
    },

    /// The adapter does not support the requested operation.
    #[error("Unsupported log operation: {0}")]
    Unsupported(String),

    /// The log has been closed.
    #[error("Log closed")]
    Closed,
}

/// Errors observable by callers of the engine.
///
/// `EngineError` is `Clone` because one failure is delivered both to the
/// submitting caller and to every signal subscriber.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// A handler is already registered for this event type.
    #[error("Event type already registered: {0}")]
    DuplicateType(EventTypeName),

    /// A delivered record has no registered handler.
    #[error("No event handler registered with name: {event_type} (position {position})")]
    UnknownType {
        /// The unregistered type
        event_type: EventTypeName,
        /// Position the record was delivered at
        position: Position,
    },

    /// The handler rejected the event before it was appended.
    #[error("{0}")]
    PreValidation(HandlerError),

    /// The handler rejected the event after it was committed.
    #[error("{source}")]
    PostValidation {
        /// Position of the rejected record
        position: Position,
        /// The handler's reason
        source: HandlerError,
    },

    /// The handler failed to project the event.
    #[error("{source}")]
    Projection {
        /// Position of the failed record
        position: Position,
        /// The handler's reason
        source: HandlerError,
    },

    /// The log delivered a record out of order.
    #[error("Major internal error: record delivered at position {delivered}, expected {expected}")]
    OrderingViolation {
        /// The position the engine expected next
        expected: Position,
        /// The position the log actually delivered
        delivered: Position,
    },

    /// The operation is not available for this log.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// The event type name is not valid.
    #[error("Invalid event type name: {0}")]
    InvalidEventType(String),

    /// Props could not be turned into plain data.
    #[error("Invalid event props: {0}")]
    InvalidProps(String),

    /// The durable log failed.
    #[error("Log error: {0}")]
    Log(#[from] LogError),

    /// The log was replaced before the record was delivered.
    #[error("Engine restarted before the event was projected")]
    Restarted,

    /// The engine stopped consuming before the record was delivered.
    #[error("Engine stopped before the event was projected")]
    Stopped,
}

impl EngineError {
    /// Returns the handler's error when the failure came from a handler.
    pub const fn handler_error(&self) -> Option<&HandlerError> {
        match self {
            Self::PreValidation(source)
            | Self::PostValidation { source, .. }
            | Self::Projection { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Whether this error means the consumption loop can no longer proceed.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::OrderingViolation { .. })
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidProps(err.to_string())
    }
}

/// Type alias for handler results.
pub type HandlerResult<T> = Result<T, HandlerError>;

/// Type alias for durable log results.
pub type LogResult<T> = Result<T, LogError>;

/// Type alias for engine results.
pub type EngineResult<T> = Result<T, EngineError>;
