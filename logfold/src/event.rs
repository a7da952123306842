//! Event instances: the view of one record that handlers, callers and signal
//! subscribers see.

use crate::errors::{EngineError, HandlerResult};
use crate::types::{EventTypeName, Fingerprint, Position};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// One event as it moves through validation and projection.
///
/// `position` is `None` while the event is being pre-validated and has not
/// been appended yet. Once the record has been committed and delivered it
/// carries the committed position.
#[derive(Debug, Clone)]
pub struct EventInstance {
    /// The event's type
    pub event_type: EventTypeName,
    /// An isolated copy of the event's props
    pub props: Value,
    /// The committed position, if any
    pub position: Option<Position>,
    /// The fingerprint of the append, once appended
    pub fingerprint: Option<Fingerprint>,
    /// Why the event failed, if it did
    pub error: Option<EngineError>,
}

impl EventInstance {
    /// Creates an event that has not been appended yet.
    pub const fn pending(event_type: EventTypeName, props: Value) -> Self {
        Self {
            event_type,
            props,
            position: None,
            fingerprint: None,
            error: None,
        }
    }

    /// Creates an event for a committed record.
    pub const fn committed(
        event_type: EventTypeName,
        props: Value,
        position: Position,
        fingerprint: Fingerprint,
    ) -> Self {
        Self {
            event_type,
            props,
            position: Some(position),
            fingerprint: Some(fingerprint),
            error: None,
        }
    }

    /// Returns this event with its error slot set.
    #[must_use]
    pub fn failed(mut self, error: EngineError) -> Self {
        self.error = Some(error);
        self
    }

    /// Whether the event has been committed to the log.
    pub const fn is_committed(&self) -> bool {
        self.position.is_some()
    }

    /// Decodes the props into a typed value.
    pub fn props_as<T: DeserializeOwned>(&self) -> HandlerResult<T> {
        Ok(T::deserialize(&self.props)?)
    }
}

#[derive(Serialize)]
struct Rendered<'a> {
    #[serde(rename = "type")]
    event_type: &'a EventTypeName,
    props: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    position: Option<Position>,
}

impl std::fmt::Display for EventInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rendered = Rendered {
            event_type: &self.event_type,
            props: &self.props,
            position: self.position,
        };
        let json = serde_json::to_string(&rendered).map_err(|_| std::fmt::Error)?;
        f.write_str(&json)
    }
}

/// What a handler is given when asked to validate or project an event.
///
/// `state` is the snapshot visible at evaluation time. During pre-validation
/// it may be stale; only the committed pass (`position` is `Some`) is
/// authoritative.
#[derive(Debug)]
pub struct EventContext<'a, S> {
    /// The event's type
    pub event_type: &'a EventTypeName,
    /// The event's props
    pub props: &'a Value,
    /// The committed position, `None` before the event is appended
    pub position: Option<Position>,
    /// The state the event is evaluated against
    pub state: &'a S,
}

impl<'a, S> EventContext<'a, S> {
    /// Creates a context over the given event and state.
    pub const fn new(event: &'a EventInstance, state: &'a S) -> Self {
        Self {
            event_type: &event.event_type,
            props: &event.props,
            position: event.position,
            state,
        }
    }

    /// Whether this is the committed (post-append) evaluation.
    pub const fn is_committed(&self) -> bool {
        self.position.is_some()
    }

    /// Decodes the props into a typed value.
    pub fn props_as<T: DeserializeOwned>(&self) -> HandlerResult<T> {
        Ok(T::deserialize(self.props)?)
    }
}
