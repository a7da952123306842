//! Response correlation: matches a submission with the later delivery of the
//! record it appended.
//!
//! The submitting side registers a one-shot sender under the append's
//! fingerprint; the consumption loop takes it out when the same fingerprint is
//! delivered and settles it. Records appended by other processes, or by
//! fire-and-forget submissions, have no entry and settle nothing.
//!
//! A record can be delivered before its submitter has registered, because the
//! append returns only after the record is visible to subscribers. While any
//! local append is in flight, outcomes with no entry are kept as unclaimed so
//! the submitter can pick them up when it registers. Once no append is in
//! flight nobody can claim them and they are discarded.

use crate::errors::{EngineError, EngineResult};
use crate::event::EventInstance;
use crate::types::Fingerprint;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::oneshot;

/// The value a pending submission settles with.
pub type Outcome = EngineResult<EventInstance>;

#[derive(Debug, Default)]
struct Entries {
    pending: HashMap<Fingerprint, oneshot::Sender<Outcome>>,
    unclaimed: HashMap<Fingerprint, Outcome>,
    in_flight: usize,
}

impl Entries {
    fn finish_append(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
        if self.in_flight == 0 {
            self.unclaimed.clear();
        }
    }
}

/// Pending submissions keyed by fingerprint.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    entries: Mutex<Entries>,
}

/// Marks one local append as in flight until it is registered or dropped.
#[derive(Debug)]
#[must_use = "dropping the guard ends the append"]
pub struct AppendGuard<'a> {
    table: &'a CorrelationTable,
}

impl AppendGuard<'_> {
    /// Registers a pending entry for the appended record and returns the
    /// receiving half.
    ///
    /// If the record was already delivered, the receiver is settled with the
    /// outcome kept for it.
    pub fn register(self, fingerprint: Fingerprint) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        let mut entries = self.table.entries.lock();
        match entries.unclaimed.remove(&fingerprint) {
            Some(outcome) => {
                let _ = tx.send(outcome);
            }
            None => {
                entries.pending.insert(fingerprint, tx);
            }
        }
        drop(entries);
        rx
    }
}

impl Drop for AppendGuard<'_> {
    fn drop(&mut self) {
        self.table.entries.lock().finish_append();
    }
}

impl CorrelationTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the start of a local append whose outcome will be waited on.
    pub fn begin_append(&self) -> AppendGuard<'_> {
        self.entries.lock().in_flight += 1;
        AppendGuard { table: self }
    }

    /// Registers a pending entry and returns the receiving half.
    pub fn register(&self, fingerprint: Fingerprint) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        self.entries.lock().pending.insert(fingerprint, tx);
        rx
    }

    /// Settles the entry for a delivered record.
    ///
    /// With no entry, the outcome is kept for a local append that has not
    /// registered yet, if there is one. Returns whether an entry was settled.
    pub fn deliver(&self, fingerprint: &Fingerprint, outcome: Outcome) -> bool {
        let mut entries = self.entries.lock();
        if let Some(tx) = entries.pending.remove(fingerprint) {
            drop(entries);
            let _ = tx.send(outcome);
            return true;
        }
        if entries.in_flight > 0 {
            entries.unclaimed.insert(fingerprint.clone(), outcome);
        }
        false
    }

    /// Settles and removes the entry for `fingerprint`.
    ///
    /// Returns whether an entry existed. A caller that stopped waiting is not
    /// an error.
    pub fn resolve(&self, fingerprint: &Fingerprint, outcome: Outcome) -> bool {
        let Some(tx) = self.entries.lock().pending.remove(fingerprint) else {
            return false;
        };
        let _ = tx.send(outcome);
        true
    }

    /// Whether an entry is waiting on `fingerprint`.
    pub fn is_pending(&self, fingerprint: &Fingerprint) -> bool {
        self.entries.lock().pending.contains_key(fingerprint)
    }

    /// Number of entries still waiting.
    pub fn len(&self) -> usize {
        self.entries.lock().pending.len()
    }

    /// Whether no entries are waiting.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().pending.is_empty()
    }

    /// Settles every waiting entry with `error` and empties the table.
    ///
    /// Outcomes kept for appends still in flight stay claimable.
    pub fn fail_all(&self, error: &EngineError) -> usize {
        let drained: Vec<_> = self.entries.lock().pending.drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(error.clone()));
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventTypeName, Position};
    use serde_json::json;

    fn event() -> EventInstance {
        EventInstance::committed(
            EventTypeName::try_new("A").unwrap(),
            json!("x"),
            Position::new(0),
            Fingerprint::new("fp-1"),
        )
    }

    #[tokio::test]
    async fn resolving_settles_the_receiver_and_removes_the_entry() {
        let table = CorrelationTable::new();
        let fingerprint = Fingerprint::new("fp-1");
        let rx = table.register(fingerprint.clone());
        assert!(table.is_pending(&fingerprint));

        assert!(table.resolve(&fingerprint, Ok(event())));
        assert!(table.is_empty());

        let settled = rx.await.unwrap().unwrap();
        assert_eq!(settled.position, Some(Position::new(0)));
    }

    #[test]
    fn resolving_an_unknown_fingerprint_is_a_no_op() {
        let table = CorrelationTable::new();
        assert!(!table.resolve(&Fingerprint::new("elsewhere"), Ok(event())));
    }

    #[test]
    fn resolving_after_the_caller_gave_up_is_not_an_error() {
        let table = CorrelationTable::new();
        let fingerprint = Fingerprint::new("fp-1");
        drop(table.register(fingerprint.clone()));
        assert!(table.resolve(&fingerprint, Ok(event())));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn fail_all_settles_every_entry() {
        let table = CorrelationTable::new();
        let first = table.register(Fingerprint::new("a"));
        let second = table.register(Fingerprint::new("b"));

        assert_eq!(table.fail_all(&EngineError::Restarted), 2);
        assert_eq!(table.len(), 0);
        assert!(matches!(first.await.unwrap(), Err(EngineError::Restarted)));
        assert!(matches!(second.await.unwrap(), Err(EngineError::Restarted)));
    }

    #[tokio::test]
    async fn outcomes_delivered_before_registration_are_claimed() {
        let table = CorrelationTable::new();
        let fingerprint = Fingerprint::new("fp-1");
        let append = table.begin_append();

        assert!(!table.deliver(&fingerprint, Ok(event())));
        let rx = append.register(fingerprint.clone());

        assert!(table.is_empty());
        let settled = rx.await.unwrap().unwrap();
        assert_eq!(settled.fingerprint, Some(fingerprint));
    }

    #[tokio::test]
    async fn registering_before_delivery_waits_for_it() {
        let table = CorrelationTable::new();
        let append = table.begin_append();
        let mut rx = append.register(Fingerprint::new("fp-1"));

        assert!(rx.try_recv().is_err());
        assert!(table.deliver(&Fingerprint::new("fp-1"), Ok(event())));
        assert!(rx.await.unwrap().is_ok());
    }

    #[test]
    fn outcomes_are_not_kept_without_a_local_append_in_flight() {
        let table = CorrelationTable::new();
        assert!(!table.deliver(&Fingerprint::new("elsewhere"), Ok(event())));

        let append = table.begin_append();
        let mut rx = append.register(Fingerprint::new("elsewhere"));
        assert!(rx.try_recv().is_err());
        assert!(table.is_pending(&Fingerprint::new("elsewhere")));
    }

    #[test]
    fn unclaimed_outcomes_are_dropped_when_the_last_append_ends() {
        let table = CorrelationTable::new();
        let append = table.begin_append();
        table.deliver(&Fingerprint::new("other"), Ok(event()));
        drop(append);

        let append = table.begin_append();
        let mut rx = append.register(Fingerprint::new("other"));
        assert!(rx.try_recv().is_err());
    }
}
