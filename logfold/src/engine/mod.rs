//! The projection engine.
//!
//! An [`Engine`] ties the pieces together:
//!
//! - the **submission pipeline** ([`Engine::submit`], [`Engine::enqueue`],
//!   [`Engine::submit_detached`]) pre-validates an event, appends it to the
//!   durable log and hands back a result that settles once the record has
//!   been delivered and projected
//! - the **consumption loop** (one background task) folds every delivered
//!   record into the state, in log order, exactly once
//! - the **restart controller** ([`Engine::restart`]) discards an ephemeral
//!   log and starts over from a given state
//!
//! Several engines attached to the same log converge on the same state,
//! because state is only ever a fold over the log.
//!
//! # Example
//!
//! ```rust,ignore
//! let log = InMemoryLog::ephemeral();
//! let engine = Engine::start(log, Users::default()).await?;
//!
//! engine.register("UserAdded", handler_fn(|ctx: &EventContext<'_, Users>| {
//!     let user: NewUser = ctx.props_as()?;
//!     Ok(Some(ctx.state.with(user)))
//! }))?;
//!
//! let event = engine.submit("UserAdded", &NewUser::new("John Doe")).await?;
//! assert_eq!(event.position, Some(Position::ZERO));
//! ```

mod consumer;

use crate::config::EngineConfig;
use crate::correlation::{CorrelationTable, Outcome};
use crate::errors::{EngineError, EngineResult};
use crate::event::{EventContext, EventInstance};
use crate::log::DurableLog;
use crate::record::EventRecord;
use crate::registry::{EventHandler, EventTypeRegistry};
use crate::signal::{Signal, SignalBus};
use crate::state::StateStore;
use crate::types::{EventTypeName, Fingerprint, LogHandle, Position};
use serde::Serialize;
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

/// State shared between the engine handle and its consumption loop.
struct Shared<S>
where
    S: Send + Sync,
{
    registry: EventTypeRegistry<S>,
    store: StateStore<S>,
    correlations: CorrelationTable,
    signals: SignalBus,
    /// Read side: held by submitters from append until their pending entry
    /// is registered. Write side: held by restart while swapping logs.
    append_gate: tokio::sync::RwLock<()>,
    position: watch::Sender<Position>,
    /// Why the loop is not running, if it is not.
    halted: watch::Sender<Option<EngineError>>,
}

struct ConsumerHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    async fn shut_down(self) {
        let _ = self.shutdown.send(());
        if let Err(err) = self.task.await {
            if err.is_panic() {
                error!("consumption loop panicked");
            }
        }
    }
}

struct Inner<S>
where
    S: Send + Sync,
{
    shared: Arc<Shared<S>>,
    log: parking_lot::RwLock<Arc<dyn DurableLog>>,
    consumer: tokio::sync::Mutex<Option<ConsumerHandle>>,
}

/// Handle to a running projection engine.
///
/// Cloning the handle is cheap; all clones drive the same engine. The
/// consumption loop ends when [`stop`](Self::stop) is called or when the last
/// handle is dropped.
pub struct Engine<S>
where
    S: Send + Sync,
{
    inner: Arc<Inner<S>>,
}

impl<S> Clone for Engine<S>
where
    S: Send + Sync,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> std::fmt::Debug for Engine<S>
where
    S: Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("log", &self.inner.log.read().handle())
            .field("position", &*self.inner.shared.position.borrow())
            .field("registry", &self.inner.shared.registry)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Engine`].
///
/// Handlers registered on the builder are in place before the first record
/// is read, which matters when attaching to a log that already has records.
pub struct EngineBuilder<S>
where
    S: Send + Sync,
{
    log: Arc<dyn DurableLog>,
    initial_state: S,
    resume: Option<(Position, S)>,
    config: EngineConfig,
    registry: EventTypeRegistry<S>,
}

impl<S> EngineBuilder<S>
where
    S: Clone + Send + Sync + 'static,
{
    /// Starts building an engine over `log` folding from `initial_state`.
    pub fn new(log: Arc<dyn DurableLog>, initial_state: S) -> Self {
        Self {
            log,
            initial_state,
            resume: None,
            config: EngineConfig::default(),
            registry: EventTypeRegistry::new(),
        }
    }

    /// Registers the handler for an event type before the engine starts.
    ///
    /// Fails with [`EngineError::DuplicateType`] if the type is already
    /// registered.
    pub fn register<T, H>(self, event_type: T, handler: H) -> EngineResult<Self>
    where
        T: TryInto<EventTypeName>,
        T::Error: Display,
        H: EventHandler<S> + 'static,
    {
        self.registry.register(parse_type(event_type)?, handler)?;
        Ok(self)
    }

    /// Starts consuming at `position` instead of 0.
    ///
    /// `state` must be the fold of the initial state over every record before
    /// `position`.
    #[must_use]
    pub fn resume_from(mut self, position: Position, state: S) -> Self {
        self.resume = Some((position, state));
        self
    }

    /// Uses `config` instead of the default configuration.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Subscribes to the log and starts the consumption loop.
    #[instrument(skip_all, fields(log = %self.log.handle()))]
    pub async fn build(self) -> EngineResult<Engine<S>> {
        let (start, store) = match self.resume {
            Some((position, state)) => (position, StateStore::resumed(self.initial_state, state)),
            None => (Position::ZERO, StateStore::new(self.initial_state)),
        };

        let shared = Arc::new(Shared {
            registry: self.registry,
            store,
            correlations: CorrelationTable::new(),
            signals: SignalBus::new(self.config.signal_capacity.into_inner()),
            append_gate: tokio::sync::RwLock::new(()),
            position: watch::Sender::new(start),
            halted: watch::Sender::new(None),
        });

        let consumer = spawn_consumer(&shared, &self.log, start).await?;
        info!(%start, "engine started");

        Ok(Engine {
            inner: Arc::new(Inner {
                shared,
                log: parking_lot::RwLock::new(self.log),
                consumer: tokio::sync::Mutex::new(Some(consumer)),
            }),
        })
    }
}

async fn spawn_consumer<S>(
    shared: &Arc<Shared<S>>,
    log: &Arc<dyn DurableLog>,
    from: Position,
) -> EngineResult<ConsumerHandle>
where
    S: Clone + Send + Sync + 'static,
{
    let subscription = log.subscribe(from).await?;
    let (shutdown, shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(consumer::run(
        Arc::clone(shared),
        subscription,
        from,
        shutdown_rx,
    ));
    Ok(ConsumerHandle { shutdown, task })
}

fn parse_type<T>(event_type: T) -> EngineResult<EventTypeName>
where
    T: TryInto<EventTypeName>,
    T::Error: Display,
{
    event_type
        .try_into()
        .map_err(|err| EngineError::InvalidEventType(err.to_string()))
}

/// A submission that has been appended and is waiting to be projected.
#[derive(Debug)]
pub struct PendingOutcome {
    fingerprint: Fingerprint,
    receiver: oneshot::Receiver<Outcome>,
}

impl PendingOutcome {
    /// The fingerprint of the append.
    pub const fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Waits until the record has been delivered and its outcome settled.
    pub async fn wait(self) -> EngineResult<EventInstance> {
        self.receiver.await.unwrap_or(Err(EngineError::Stopped))
    }
}

impl<S> Engine<S>
where
    S: Clone + Send + Sync + 'static,
{
    /// Starts building an engine over `log`.
    pub fn builder(log: Arc<dyn DurableLog>, initial_state: S) -> EngineBuilder<S> {
        EngineBuilder::new(log, initial_state)
    }

    /// Starts an engine over `log` with the default configuration.
    pub async fn start(log: Arc<dyn DurableLog>, initial_state: S) -> EngineResult<Self> {
        EngineBuilder::new(log, initial_state).build().await
    }

    /// Registers the handler for an event type.
    ///
    /// Fails with [`EngineError::DuplicateType`] if the type is already
    /// registered; the first registration stays in place. Records consumed
    /// before registration were skipped as unknown, so handlers for a log
    /// that already has records belong on the [`EngineBuilder`].
    pub fn register<T, H>(&self, event_type: T, handler: H) -> EngineResult<()>
    where
        T: TryInto<EventTypeName>,
        T::Error: Display,
        H: EventHandler<S> + 'static,
    {
        let event_type = parse_type(event_type)?;
        debug!(%event_type, "registering event handler");
        self.inner.shared.registry.register(event_type, handler)
    }

    /// Registered event type names, sorted.
    pub fn registered_types(&self) -> Vec<EventTypeName> {
        self.inner.shared.registry.registered_types()
    }

    /// Submits an event and waits until it has been projected.
    ///
    /// Resolves with the committed event once this engine's consumption loop
    /// has applied that exact record. Fails without appending if
    /// pre-validation rejects the event, and after appending if
    /// post-validation or projection does.
    pub async fn submit<T, P>(&self, event_type: T, props: &P) -> EngineResult<EventInstance>
    where
        T: TryInto<EventTypeName>,
        T::Error: Display,
        P: Serialize + ?Sized,
    {
        self.enqueue(event_type, props).await?.wait().await
    }

    /// Submits an event and returns as soon as it has been appended.
    ///
    /// The returned [`PendingOutcome`] settles like [`submit`](Self::submit).
    #[instrument(skip_all, fields(event_type))]
    pub async fn enqueue<T, P>(&self, event_type: T, props: &P) -> EngineResult<PendingOutcome>
    where
        T: TryInto<EventTypeName>,
        T::Error: Display,
        P: Serialize + ?Sized,
    {
        let (fingerprint, receiver) = self.append(event_type, props, true).await?;
        let receiver = receiver.ok_or(EngineError::Stopped)?;
        Ok(PendingOutcome {
            fingerprint,
            receiver,
        })
    }

    /// Submits an event without waiting for, or being told, its outcome.
    ///
    /// Pre-validation still runs; the returned fingerprint identifies the
    /// append.
    #[instrument(skip_all, fields(event_type))]
    pub async fn submit_detached<T, P>(&self, event_type: T, props: &P) -> EngineResult<Fingerprint>
    where
        T: TryInto<EventTypeName>,
        T::Error: Display,
        P: Serialize + ?Sized,
    {
        let (fingerprint, _) = self.append(event_type, props, false).await?;
        Ok(fingerprint)
    }

    async fn append<T, P>(
        &self,
        event_type: T,
        props: &P,
        correlate: bool,
    ) -> EngineResult<(Fingerprint, Option<oneshot::Receiver<Outcome>>)>
    where
        T: TryInto<EventTypeName>,
        T::Error: Display,
        P: Serialize + ?Sized,
    {
        let shared = &self.inner.shared;
        let record = EventRecord::from_serialize(parse_type(event_type)?, props)?;
        tracing::Span::current().record("event_type", tracing::field::display(&record.event_type));

        let halted = shared.halted.borrow().clone();
        if let Some(reason) = halted {
            return Err(reason);
        }

        if let Some(handler) = shared.registry.get(&record.event_type) {
            let event = EventInstance::pending(record.event_type.clone(), record.props.clone());
            let state = shared.store.snapshot();
            let validated = handler.validate(&EventContext::new(&event, &*state)).await;
            if let Err(source) = validated {
                debug!(%source, "pre-validation failed, not appending");
                let error = EngineError::PreValidation(source);
                shared
                    .signals
                    .emit(Signal::FailedPreValidation(event.failed(error.clone())));
                return Err(error);
            }
        }

        let _gate = shared.append_gate.read().await;
        let in_flight = correlate.then(|| shared.correlations.begin_append());
        let log = Arc::clone(&*self.inner.log.read());
        let metadata = log.append(record).await?;
        let fingerprint = metadata.fingerprint();
        debug!(%fingerprint, "event appended");

        let Some(in_flight) = in_flight else {
            return Ok((fingerprint, None));
        };

        // The loop does not wait for us, so the record may already have been
        // delivered; registering picks up its outcome in that case.
        let receiver = in_flight.register(fingerprint.clone());
        // The loop may have halted while we were appending; it will never
        // deliver this record.
        let halted = shared.halted.borrow().clone();
        if let Some(reason) = halted {
            shared.correlations.resolve(&fingerprint, Err(reason));
        }
        Ok((fingerprint, Some(receiver)))
    }

    /// An isolated copy of the current state.
    pub fn state(&self) -> S {
        self.inner.shared.store.state()
    }

    /// An isolated copy of the initial state.
    pub fn initial_state(&self) -> S {
        self.inner.shared.store.initial_state()
    }

    /// The position of the next record the engine expects, which is also the
    /// number of records it has consumed.
    pub fn position(&self) -> Position {
        *self.inner.shared.position.borrow()
    }

    /// The handle other engines use to attach to the same log.
    pub fn log_handle(&self) -> LogHandle {
        self.inner.log.read().handle().clone()
    }

    /// Listens for signals fired from now on.
    pub fn signals(&self) -> broadcast::Receiver<Signal> {
        self.inner.shared.signals.subscribe()
    }

    /// Whether the consumption loop is running.
    pub fn is_running(&self) -> bool {
        self.inner.shared.halted.borrow().is_none()
    }

    /// The fatal error that halted the consumption loop, if any.
    pub fn fatal_error(&self) -> Option<EngineError> {
        self.inner
            .shared
            .halted
            .borrow()
            .clone()
            .filter(|reason| !matches!(reason, EngineError::Stopped))
    }

    /// Waits until the consumption loop halts and returns why.
    pub async fn wait_for_halt(&self) -> EngineError {
        let mut halted = self.inner.shared.halted.subscribe();
        let reason = match halted.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone(),
            Err(_) => None,
        };
        reason.unwrap_or(EngineError::Stopped)
    }

    /// Waits until the engine has consumed every record before `position`.
    ///
    /// Fails if the consumption loop halts first.
    pub async fn wait_for_position(&self, position: Position) -> EngineResult<()> {
        let mut current = self.inner.shared.position.subscribe();
        tokio::select! {
            // A halted engine may already have reached `position`.
            biased;
            reached = current.wait_for(|current| *current >= position) => {
                reached.map(|_| ()).map_err(|_| EngineError::Stopped)
            }
            reason = self.wait_for_halt() => Err(reason),
        }
    }

    /// Stops consuming the log.
    ///
    /// A record whose handler is still running is finished first. Pending
    /// submissions fail with [`EngineError::Stopped`].
    #[instrument(skip(self), fields(log = %self.log_handle()))]
    pub async fn stop(&self) {
        // Held throughout, so a concurrent restart cannot spawn a loop that
        // this stop then marks as halted.
        let mut consumer = self.inner.consumer.lock().await;
        if let Some(running) = consumer.take() {
            running.shut_down().await;
        }
        let shared = &self.inner.shared;
        shared.halted.send_if_modified(|halted| {
            if halted.is_some() {
                return false;
            }
            *halted = Some(EngineError::Stopped);
            true
        });
        shared.correlations.fail_all(&EngineError::Stopped);
        drop(consumer);
        info!(position = %self.position(), "engine stopped");
    }

    /// Discards an ephemeral log and starts over from `state`.
    ///
    /// Waits for in-flight appends to drain, replaces the log with a fresh
    /// empty one, resets the position to 0 and the state to `state` (or the
    /// initial state), and resubscribes. Submissions still pending against
    /// the discarded log fail with [`EngineError::Restarted`].
    ///
    /// Fails with [`EngineError::UnsupportedOperation`] for a log that was
    /// opened by name, since other readers may depend on its positions.
    #[instrument(skip_all, fields(log = %self.log_handle()))]
    pub async fn restart(&self, state: Option<S>) -> EngineResult<()> {
        let old_log = Arc::clone(&*self.inner.log.read());
        if !old_log.is_ephemeral() {
            return Err(EngineError::UnsupportedOperation(format!(
                "restart is only supported for ephemeral logs, '{}' is named",
                old_log.handle()
            )));
        }

        let shared = &self.inner.shared;
        let mut consumer = self.inner.consumer.lock().await;
        if let Some(running) = consumer.take() {
            running.shut_down().await;
        }

        let _gate = shared.append_gate.write().await;
        old_log.drained().await;
        debug!("log drained");

        let fresh = match old_log.fresh().await {
            Ok(fresh) => fresh,
            Err(err) => {
                // Leave the engine consuming the old log as before.
                *consumer = Some(spawn_consumer(shared, &old_log, self.position()).await?);
                return Err(err.into());
            }
        };

        *self.inner.log.write() = Arc::clone(&fresh);
        let failed = shared.correlations.fail_all(&EngineError::Restarted);
        shared.store.reset(state);
        shared.position.send_replace(Position::ZERO);
        shared.halted.send_replace(None);
        *consumer = Some(spawn_consumer(shared, &fresh, Position::ZERO).await?);

        info!(new_log = %fresh.handle(), failed, "engine restarted");
        Ok(())
    }
}
