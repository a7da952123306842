//! The state store: the current projected state and the initial state it was
//! folded from.
//!
//! Only the consumption loop replaces the current state. Every read handed to
//! code outside the engine is a clone, so nothing outside can hold a live
//! reference into the stored value.

use parking_lot::RwLock;
use std::sync::Arc;

/// Holds the initial and current application state.
#[derive(Debug)]
pub struct StateStore<S> {
    initial: Arc<S>,
    current: RwLock<Arc<S>>,
}

impl<S> StateStore<S>
where
    S: Clone,
{
    /// Creates a store whose current state starts as a copy of `initial`.
    pub fn new(initial: S) -> Self {
        let current = Arc::new(initial.clone());
        Self {
            initial: Arc::new(initial),
            current: RwLock::new(current),
        }
    }

    /// Creates a store resuming from `current`, which was folded from
    /// `initial`.
    pub fn resumed(initial: S, current: S) -> Self {
        Self {
            initial: Arc::new(initial),
            current: RwLock::new(Arc::new(current)),
        }
    }

    /// Returns an isolated copy of the current state.
    pub fn state(&self) -> S {
        S::clone(&self.current.read())
    }

    /// Returns an isolated copy of the initial state.
    pub fn initial_state(&self) -> S {
        S::clone(&self.initial)
    }

    /// Returns the current state for evaluation inside the engine.
    ///
    /// The snapshot is immutable; replacing the state later does not change
    /// a snapshot already taken.
    pub(crate) fn snapshot(&self) -> Arc<S> {
        Arc::clone(&self.current.read())
    }

    /// Replaces the current state with the committed result of one record.
    pub(crate) fn replace(&self, state: S) {
        *self.current.write() = Arc::new(state);
    }

    /// Resets the current state to `state`, or to a copy of the initial state.
    pub(crate) fn reset(&self, state: Option<S>) {
        let state = state.unwrap_or_else(|| self.initial_state());
        self.replace(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn state_starts_as_a_copy_of_the_initial_state() {
        let initial = json!({ "monkeys": 5, "bonkeys": [5, 6, { "what": [4, 3, 2] }] });
        let store = StateStore::new(initial.clone());
        assert_eq!(store.state(), initial);
        assert_eq!(store.initial_state(), initial);
    }

    #[test]
    fn mutating_a_read_does_not_change_the_store() {
        let store = StateStore::new(json!({ "users": [] }));

        let mut read = store.state();
        read["users"] = json!(["intruder"]);

        let mut initial = store.initial_state();
        initial["users"] = json!(["intruder"]);

        assert_eq!(store.state(), json!({ "users": [] }));
        assert_eq!(store.initial_state(), json!({ "users": [] }));
    }

    #[test]
    fn snapshots_are_unaffected_by_later_replacement() {
        let store = StateStore::new(json!(1));
        let before = store.snapshot();
        store.replace(json!(2));
        assert_eq!(*before, json!(1));
        assert_eq!(store.state(), json!(2));
    }

    #[test]
    fn reset_falls_back_to_initial_state() {
        let store: StateStore<Value> = StateStore::new(json!([]));
        store.replace(json!(["a"]));
        store.reset(None);
        assert_eq!(store.state(), json!([]));

        store.reset(Some(json!(["b"])));
        assert_eq!(store.state(), json!(["b"]));
        assert_eq!(store.initial_state(), json!([]));
    }
}
