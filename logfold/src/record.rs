//! Records as they are stored in, and delivered by, the durable log.

use crate::types::{EventTypeName, Fingerprint, Position, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One immutable `(type, props)` pair stored at a log position.
///
/// Props are plain data: anything representable as JSON. Constructing a
/// record from a `Serialize` value performs a structural copy, so later
/// mutation of the caller's value cannot reach the stored record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// The event type the record was submitted as
    #[serde(rename = "type")]
    pub event_type: EventTypeName,
    /// The event's plain-data payload
    pub props: Value,
}

impl EventRecord {
    /// Creates a record from already plain props.
    pub const fn new(event_type: EventTypeName, props: Value) -> Self {
        Self { event_type, props }
    }

    /// Creates a record by structurally copying `props` into plain data.
    pub fn from_serialize<P>(event_type: EventTypeName, props: &P) -> serde_json::Result<Self>
    where
        P: Serialize + ?Sized,
    {
        Ok(Self::new(event_type, serde_json::to_value(props)?))
    }
}

/// Metadata the log returns for every append.
///
/// The fields together identify one append uniquely, even when several
/// processes append to the same log at the same time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendMetadata {
    /// Checksum of the stored record's content
    pub checksum: String,
    /// Host the append originated from
    pub host: String,
    /// Process the append originated from
    pub pid: u32,
    /// Per-process counter distinguishing appends of one process
    pub nonce: u64,
    /// When the append happened
    pub time: Timestamp,
}

impl AppendMetadata {
    /// Derives the correlation fingerprint for this append.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::new(format!(
            "{}-{}-{}-{}-{}",
            self.checksum,
            self.host,
            self.pid,
            self.nonce,
            self.time.as_datetime().timestamp_nanos_opt().unwrap_or_default()
        ))
    }
}

/// A record handed to a subscriber, together with where and how it was
/// appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// The position the log assigned to the record
    pub position: Position,
    /// The stored record
    pub record: EventRecord,
    /// The metadata returned when the record was appended
    pub metadata: AppendMetadata,
}
