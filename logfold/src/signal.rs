//! Observable signals fired by the engine.
//!
//! Signals are broadcast whether or not anyone listens. A slow listener that
//! falls behind the configured capacity misses the oldest signals, it never
//! slows the consumption loop down.

use crate::event::EventInstance;
use tokio::sync::broadcast;

/// Something that happened to one event.
#[derive(Debug, Clone)]
pub enum Signal {
    /// The handler rejected the event before it was appended.
    FailedPreValidation(EventInstance),
    /// The handler rejected the event after it was committed.
    FailedPostValidation(EventInstance),
    /// The handler failed to project the event.
    FailedProjection(EventInstance),
    /// The event was projected onto the state.
    SuccessfulProjection(EventInstance),
}

impl Signal {
    /// The event the signal is about.
    pub const fn event(&self) -> &EventInstance {
        match self {
            Self::FailedPreValidation(event)
            | Self::FailedPostValidation(event)
            | Self::FailedProjection(event)
            | Self::SuccessfulProjection(event) => event,
        }
    }

    /// A short name for logging.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::FailedPreValidation(_) => "failed_pre_validation",
            Self::FailedPostValidation(_) => "failed_post_validation",
            Self::FailedProjection(_) => "failed_projection",
            Self::SuccessfulProjection(_) => "successful_projection",
        }
    }

    /// Whether the signal reports a failure.
    pub const fn is_failure(&self) -> bool {
        !matches!(self, Self::SuccessfulProjection(_))
    }
}

/// Fan-out point for signals.
#[derive(Debug, Clone)]
pub(crate) struct SignalBus {
    sender: broadcast::Sender<Signal>,
}

impl SignalBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub(crate) fn emit(&self, signal: Signal) {
        // No receivers is the common case and not an error.
        let _ = self.sender.send(signal);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.sender.subscribe()
    }
}
