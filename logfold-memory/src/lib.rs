//! In-memory durable log for the `logfold` projection engine
//!
//! This crate provides an in-memory implementation of the
//! [`DurableLog`](logfold::log::DurableLog) trait, useful for testing, demos
//! and any setup where the log does not have to outlive the process.
//!
//! Logs are registered process-wide under their [`LogHandle`], so several
//! engines attach to one log the same way they would attach to one file:
//!
//! ```rust,ignore
//! let log = InMemoryLog::ephemeral();
//! let first = Engine::start(log.clone(), Users::default()).await?;
//! let second = Engine::start(InMemoryLog::open(log.handle().clone()), Users::default()).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

mod subscription;

pub use subscription::InMemorySubscription;

use async_trait::async_trait;
use logfold::errors::{LogError, LogResult};
use logfold::log::{DurableLog, LogSubscription};
use logfold::record::{AppendMetadata, EventRecord};
use logfold::types::{LogHandle, Position, Timestamp};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, instrument, trace};

/// Options for an [`InMemoryLog`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InMemoryLogConfig {
    /// Bounds of a random delay added to every append before it commits
    #[serde(default)]
    pub write_latency: Option<(Duration, Duration)>,
}

impl InMemoryLogConfig {
    /// Delays every append by a random duration in `min..=max`.
    ///
    /// Positions are assigned when the delayed write commits, so concurrent
    /// appends may land in a different order than they were started.
    #[must_use]
    pub fn with_write_latency(mut self, min: Duration, max: Duration) -> Self {
        self.write_latency = Some(if min <= max { (min, max) } else { (max, min) });
        self
    }

    fn sample_latency(&self) -> Option<Duration> {
        let (min, max) = self.write_latency?;
        let min = u64::try_from(min.as_micros()).unwrap_or(u64::MAX);
        let max = u64::try_from(max.as_micros()).unwrap_or(u64::MAX);
        Some(Duration::from_micros(rand::rng().random_range(min..=max)))
    }
}

/// How far a log has been committed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Tail {
    pub(crate) len: u64,
    pub(crate) closed: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct StoredRecord {
    pub(crate) record: EventRecord,
    pub(crate) metadata: AppendMetadata,
}

/// Storage shared by every `InMemoryLog` attached to one handle.
#[derive(Debug)]
pub(crate) struct SharedLog {
    pub(crate) records: RwLock<Vec<StoredRecord>>,
    pub(crate) tail: watch::Sender<Tail>,
    in_flight: AtomicUsize,
    drained: Notify,
}

impl SharedLog {
    fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            tail: watch::Sender::new(Tail::default()),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    /// Commits a record at the next position and wakes subscribers.
    fn push(&self, stored: StoredRecord) -> LogResult<Position> {
        let mut records = self.records.write();
        if self.tail.borrow().closed {
            return Err(LogError::Closed);
        }
        records.push(stored);
        let len = records.len() as u64;
        // Published under the write lock so the length never goes backwards.
        self.tail.send_modify(|tail| tail.len = len);
        Ok(Position::new(len - 1))
    }
}

/// Counts an append as in flight until dropped.
struct InFlight<'a>(&'a SharedLog);

impl<'a> InFlight<'a> {
    fn enter(log: &'a SharedLog) -> Self {
        log.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(log)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}

enum Registered {
    /// Opened by name; kept for the lifetime of the process.
    Pinned(Arc<SharedLog>),
    /// Kept only while some `InMemoryLog` still refers to it.
    Ephemeral(Weak<SharedLog>),
}

impl Registered {
    fn upgrade(&self) -> Option<Arc<SharedLog>> {
        match self {
            Self::Pinned(log) => Some(Arc::clone(log)),
            Self::Ephemeral(log) => log.upgrade(),
        }
    }
}

fn registry() -> &'static Mutex<HashMap<LogHandle, Registered>> {
    static LOGS: OnceLock<Mutex<HashMap<LogHandle, Registered>>> = OnceLock::new();
    LOGS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn host() -> &'static str {
    static HOST: OnceLock<String> = OnceLock::new();
    HOST.get_or_init(|| std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()))
}

static NONCE: AtomicU64 = AtomicU64::new(0);

/// A durable log kept in process memory.
#[derive(Debug)]
pub struct InMemoryLog {
    handle: LogHandle,
    ephemeral: bool,
    shared: Arc<SharedLog>,
    config: InMemoryLogConfig,
}

impl InMemoryLog {
    /// Creates a new, empty log under a generated handle.
    ///
    /// Ephemeral logs may be discarded by
    /// [`Engine::restart`](logfold::Engine::restart). They are forgotten once
    /// every `InMemoryLog` referring to them is dropped.
    pub fn ephemeral() -> Arc<Self> {
        Self::ephemeral_with(InMemoryLogConfig::default())
    }

    /// Like [`ephemeral`](Self::ephemeral), with options.
    pub fn ephemeral_with(config: InMemoryLogConfig) -> Arc<Self> {
        let handle = Self::generate_handle();
        let shared = Arc::new(SharedLog::new());
        {
            let mut logs = registry().lock();
            logs.retain(|_, log| log.upgrade().is_some());
            logs.insert(
                handle.clone(),
                Registered::Ephemeral(Arc::downgrade(&shared)),
            );
        }
        debug!(%handle, "ephemeral log created");
        Arc::new(Self {
            handle,
            ephemeral: true,
            shared,
            config,
        })
    }

    /// Attaches to the log registered under `handle`, creating it if needed.
    ///
    /// Logs reached by name are never discarded on restart, even when the
    /// handle belongs to a log that was created ephemeral elsewhere.
    pub fn open(handle: LogHandle) -> Arc<Self> {
        Self::open_with(handle, InMemoryLogConfig::default())
    }

    /// Like [`open`](Self::open), with options.
    pub fn open_with(handle: LogHandle, config: InMemoryLogConfig) -> Arc<Self> {
        let shared = {
            let mut logs = registry().lock();
            match logs.get(&handle).and_then(Registered::upgrade) {
                Some(shared) => shared,
                None => {
                    let shared = Arc::new(SharedLog::new());
                    logs.insert(handle.clone(), Registered::Pinned(Arc::clone(&shared)));
                    debug!(%handle, "named log created");
                    shared
                }
            }
        };
        Arc::new(Self {
            handle,
            ephemeral: false,
            shared,
            config,
        })
    }

    fn generate_handle() -> LogHandle {
        let name = format!("ephemeral-{}", uuid::Uuid::now_v7());
        LogHandle::try_new(name).unwrap_or_else(|_| unreachable!("generated handles are valid"))
    }

    /// Number of committed records.
    pub fn len(&self) -> usize {
        self.shared.records.read().len()
    }

    /// Whether no record has been committed yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies of every committed record, in position order.
    pub fn records(&self) -> Vec<EventRecord> {
        self.shared
            .records
            .read()
            .iter()
            .map(|stored| stored.record.clone())
            .collect()
    }

    /// Closes the log for every attached reader and writer.
    ///
    /// Subscriptions deliver what was committed before closing and then end.
    /// Further appends fail with [`LogError::Closed`].
    pub fn close(&self) {
        let _records = self.shared.records.write();
        self.shared.tail.send_modify(|tail| tail.closed = true);
        debug!(handle = %self.handle, "log closed");
    }

    /// Whether [`close`](Self::close) has been called on this log.
    pub fn is_closed(&self) -> bool {
        self.shared.tail.borrow().closed
    }
}

#[async_trait]
impl DurableLog for InMemoryLog {
    fn handle(&self) -> &LogHandle {
        &self.handle
    }

    fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    #[instrument(skip_all, fields(log = %self.handle, event_type = %record.event_type))]
    async fn append(&self, record: EventRecord) -> LogResult<AppendMetadata> {
        let _in_flight = InFlight::enter(&self.shared);
        if self.is_closed() {
            return Err(LogError::Closed);
        }

        let bytes =
            serde_json::to_vec(&record).map_err(|err| LogError::AppendFailed(err.to_string()))?;
        let metadata = AppendMetadata {
            checksum: blake3::hash(&bytes).to_hex().to_string(),
            host: host().to_string(),
            pid: std::process::id(),
            nonce: NONCE.fetch_add(1, Ordering::Relaxed),
            time: Timestamp::now(),
        };

        let latency = self.config.sample_latency();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let position = self.shared.push(StoredRecord {
            record,
            metadata: metadata.clone(),
        })?;
        trace!(%position, "record committed");
        Ok(metadata)
    }

    async fn subscribe(&self, from: Position) -> LogResult<Box<dyn LogSubscription>> {
        debug!(log = %self.handle, %from, "subscribing");
        Ok(Box::new(InMemorySubscription::new(
            Arc::clone(&self.shared),
            from,
        )))
    }

    fn is_drained(&self) -> bool {
        self.shared.in_flight.load(Ordering::SeqCst) == 0
    }

    async fn drained(&self) {
        loop {
            let notified = self.shared.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_drained() {
                return;
            }
            notified.await;
        }
    }

    async fn fresh(&self) -> LogResult<Arc<dyn DurableLog>> {
        Ok(Self::ephemeral_with(self.config.clone()))
    }
}
