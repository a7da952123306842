//! The log consumption loop.
//!
//! One task per engine. It is the only code that replaces the application
//! state, and it handles one record at a time: the subscription stays paused
//! while a record's validation or projection is outstanding, and the next
//! record is not read until the current one's outcome is settled.

use super::Shared;
use crate::correlation::Outcome;
use crate::errors::{EngineError, EngineResult, LogError};
use crate::event::{EventContext, EventInstance};
use crate::log::LogSubscription;
use crate::record::Delivery;
use crate::signal::Signal;
use crate::types::{Fingerprint, Position};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, info, instrument, warn};

/// Runs the loop until shutdown, until the log closes, or until a fatal
/// error.
pub(super) async fn run<S>(
    shared: Arc<Shared<S>>,
    mut subscription: Box<dyn LogSubscription>,
    start: Position,
    mut shutdown: oneshot::Receiver<()>,
) where
    S: Clone + Send + Sync + 'static,
{
    let mut expected = start;
    debug!(%start, "consumption loop started");

    loop {
        let next = tokio::select! {
            biased;
            _ = &mut shutdown => break,
            next = subscription.next() => next,
        };

        let delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(err)) => {
                shared.halt(EngineError::Log(err));
                break;
            }
            None => {
                info!(position = %expected, "log closed, consumption loop ending");
                shared.halt(EngineError::Log(LogError::Closed));
                break;
            }
        };

        subscription.pause();
        match shared.process(delivery, expected).await {
            Ok(next_position) => expected = next_position,
            Err(fatal) => {
                shared.halt(fatal);
                break;
            }
        }
        subscription.resume();
    }

    subscription.unsubscribe();
    debug!(position = %expected, "consumption loop stopped");
}

impl<S> Shared<S>
where
    S: Clone + Send + Sync + 'static,
{
    /// Applies one delivered record and returns the next expected position.
    ///
    /// Per-record failures are settled here and never returned. An `Err` is
    /// always fatal to the loop.
    #[instrument(
        name = "project_record",
        skip_all,
        fields(position = %delivery.position, event_type = %delivery.record.event_type)
    )]
    pub(super) async fn process(
        &self,
        delivery: Delivery,
        expected: Position,
    ) -> EngineResult<Position> {
        if delivery.position != expected {
            return Err(EngineError::OrderingViolation {
                expected,
                delivered: delivery.position,
            });
        }

        let fingerprint = delivery.metadata.fingerprint();
        let Delivery {
            position, record, ..
        } = delivery;
        let event =
            EventInstance::committed(record.event_type, record.props, position, fingerprint.clone());

        let Some(handler) = self.registry.get(&event.event_type) else {
            warn!("no handler registered, skipping record");
            let error = EngineError::UnknownType {
                event_type: event.event_type.clone(),
                position,
            };
            let next = self.advance(position);
            self.settle(&fingerprint, Err(error));
            return Ok(next);
        };

        let state = self.store.snapshot();

        let validated = handler.validate(&EventContext::new(&event, &*state)).await;
        if let Err(source) = validated {
            warn!(%source, "post-validation failed");
            let error = EngineError::PostValidation { position, source };
            let next = self.advance(position);
            self.reject(event, &fingerprint, error, Signal::FailedPostValidation);
            return Ok(next);
        }

        let projected = handler.project(&EventContext::new(&event, &*state)).await;
        drop(state);
        let next = match projected {
            Ok(new_state) => {
                if let Some(new_state) = new_state {
                    self.store.replace(new_state);
                }
                let next = self.advance(position);
                debug!("record projected");
                self.settle(&fingerprint, Ok(event.clone()));
                self.signals.emit(Signal::SuccessfulProjection(event));
                next
            }
            Err(source) => {
                warn!(%source, "projection failed");
                let error = EngineError::Projection { position, source };
                let next = self.advance(position);
                self.reject(event, &fingerprint, error, Signal::FailedProjection);
                next
            }
        };

        Ok(next)
    }

    /// Publishes the position after `position` and returns it.
    fn advance(&self, position: Position) -> Position {
        let next = position.next();
        self.position.send_replace(next);
        next
    }

    fn reject(
        &self,
        event: EventInstance,
        fingerprint: &Fingerprint,
        error: EngineError,
        signal: fn(EventInstance) -> Signal,
    ) {
        self.settle(fingerprint, Err(error.clone()));
        self.signals.emit(signal(event.failed(error)));
    }

    /// Settles the pending submission for `fingerprint`, if this engine has
    /// one.
    fn settle(&self, fingerprint: &Fingerprint, outcome: Outcome) {
        if self.correlations.deliver(fingerprint, outcome) {
            debug!(%fingerprint, "pending submission settled");
        }
    }

    /// Records a fatal error and fails every pending submission with it.
    pub(super) fn halt(&self, error: EngineError) {
        error!(%error, "consumption loop halted");
        self.halted.send_replace(Some(error.clone()));
        let failed = self.correlations.fail_all(&error);
        if failed > 0 {
            warn!(failed, "pending submissions failed by halt");
        }
    }
}
