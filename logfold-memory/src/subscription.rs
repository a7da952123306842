//! Subscriptions over an in-memory log.

use crate::{SharedLog, Tail};
use async_trait::async_trait;
use logfold::errors::{LogError, LogResult};
use logfold::log::LogSubscription;
use logfold::record::Delivery;
use logfold::types::Position;
use std::sync::Arc;
use tokio::sync::watch;

/// A cursor over an [`InMemoryLog`](crate::InMemoryLog).
///
/// Records are read on demand, so pausing simply stops reading; nothing is
/// buffered or dropped while paused.
#[derive(Debug)]
pub struct InMemorySubscription {
    log: Arc<SharedLog>,
    tail: watch::Receiver<Tail>,
    cursor: Position,
    paused: bool,
    active: bool,
}

impl InMemorySubscription {
    pub(crate) fn new(log: Arc<SharedLog>, from: Position) -> Self {
        let tail = log.tail.subscribe();
        Self {
            log,
            tail,
            cursor: from,
            paused: false,
            active: true,
        }
    }

    fn read(&self, position: Position) -> LogResult<Delivery> {
        let index = usize::try_from(position.value()).map_err(|_| LogError::CorruptRecord {
            position,
            reason: "position exceeds addressable memory".to_string(),
        })?;
        let records = self.log.records.read();
        let stored = records.get(index).ok_or_else(|| LogError::CorruptRecord {
            position,
            reason: "record announced but not stored".to_string(),
        })?;
        Ok(Delivery {
            position,
            record: stored.record.clone(),
            metadata: stored.metadata.clone(),
        })
    }
}

#[async_trait]
impl LogSubscription for InMemorySubscription {
    async fn next(&mut self) -> Option<LogResult<Delivery>> {
        if !self.active {
            return None;
        }
        if self.paused {
            std::future::pending::<()>().await;
        }

        let wanted = self.cursor.value();
        let available = self
            .tail
            .wait_for(|tail| tail.closed || tail.len > wanted)
            .await
            .map(|tail| tail.len > wanted);
        if !available.unwrap_or(false) {
            self.active = false;
            return None;
        }

        let delivery = self.read(self.cursor);
        if delivery.is_ok() {
            self.cursor = self.cursor.next();
        }
        Some(delivery)
    }

    fn pause(&mut self) {
        self.paused = true;
    }

    fn resume(&mut self) {
        self.paused = false;
    }

    fn is_paused(&self) -> bool {
        self.paused
    }

    fn unsubscribe(&mut self) {
        self.active = false;
    }

    fn cursor(&self) -> Position {
        self.cursor
    }
}
