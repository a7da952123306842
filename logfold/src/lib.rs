//! `logfold` - an event-sourcing projection engine
//!
//! An engine folds an ordered, durable log of typed events into in-memory
//! application state. Every record is applied exactly once and in log order,
//! and a caller submitting an event learns whether that exact record was
//! accepted and projected. Engines attached to the same log converge on the
//! same state, because state is never shared directly, only derived from the
//! log.
//!
//! The log itself is a collaborator reached through [`log::DurableLog`];
//! `logfold-memory` provides an in-memory implementation.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod correlation;
pub mod engine;
pub mod errors;
pub mod event;
pub mod log;
pub mod record;
pub mod registry;
pub mod signal;
pub mod state;
pub mod types;

pub use engine::{Engine, EngineBuilder, PendingOutcome};

/// Commonly used types, for glob import.
pub mod prelude {
    pub use crate::config::{EngineConfig, SignalCapacity};
    pub use crate::engine::{Engine, EngineBuilder, PendingOutcome};
    pub use crate::errors::{
        EngineError, EngineResult, HandlerError, HandlerResult, LogError, LogResult,
    };
    pub use crate::event::{EventContext, EventInstance};
    pub use crate::log::{DurableLog, LogSubscription};
    pub use crate::record::{AppendMetadata, Delivery, EventRecord};
    pub use crate::registry::{async_handler_fn, handler_fn, EventHandler};
    pub use crate::signal::Signal;
    pub use crate::types::{EventTypeName, Fingerprint, LogHandle, Position, Timestamp};
}
