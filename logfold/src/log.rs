//! The durable log contract the engine consumes.
//!
//! Storage, fingerprint material, cross-process tailing and flow control are
//! the log's concern. The engine relies only on what these two traits promise:
//!
//! - appends are serialized into one gap-free position sequence shared by
//!   every reader of the same log
//! - a subscription delivers every record at or after its start position, in
//!   position order, exactly once
//! - pausing a subscription withholds delivery without dropping or
//!   reordering records

use crate::errors::LogResult;
use crate::record::{AppendMetadata, Delivery, EventRecord};
use crate::types::{LogHandle, Position};
use async_trait::async_trait;
use std::sync::Arc;

/// An append-only, multi-reader record log.
#[async_trait]
pub trait DurableLog: Send + Sync + std::fmt::Debug {
    /// The identity other engines use to attach to this log.
    fn handle(&self) -> &LogHandle;

    /// Whether the log was created without a caller-supplied identity.
    ///
    /// Only ephemeral logs may be discarded and replaced on restart.
    fn is_ephemeral(&self) -> bool;

    /// Durably stores `record` and returns the metadata of the append.
    async fn append(&self, record: EventRecord) -> LogResult<AppendMetadata>;

    /// Starts delivering records from `from` onwards.
    async fn subscribe(&self, from: Position) -> LogResult<Box<dyn LogSubscription>>;

    /// Whether every append started so far has been committed.
    fn is_drained(&self) -> bool;

    /// Waits until [`is_drained`](Self::is_drained) holds.
    async fn drained(&self);

    /// Creates a fresh, empty, ephemeral log of the same kind.
    async fn fresh(&self) -> LogResult<Arc<dyn DurableLog>>;
}

/// One subscriber's ordered view of a log.
#[async_trait]
pub trait LogSubscription: Send + std::fmt::Debug {
    /// Waits for the next record.
    ///
    /// While paused nothing is delivered and the call stays pending. Returns
    /// `None` once the subscription has been unsubscribed or the log has been
    /// closed.
    async fn next(&mut self) -> Option<LogResult<Delivery>>;

    /// Withholds further delivery until [`resume`](Self::resume).
    fn pause(&mut self);

    /// Continues delivery after [`pause`](Self::pause).
    fn resume(&mut self);

    /// Whether delivery is currently withheld.
    fn is_paused(&self) -> bool;

    /// Stops delivery for good.
    fn unsubscribe(&mut self);

    /// The position of the next record this subscription will deliver.
    fn cursor(&self) -> Position;
}
