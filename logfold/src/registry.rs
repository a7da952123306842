//! Event type registry: maps an event type name to the handler that validates
//! and projects records of that type.
//!
//! A handler is any value implementing [`EventHandler`]. Both methods are
//! async so the consumption loop can await every handler the same way;
//! synchronous handlers simply return without suspending. For handlers that
//! are plain closures, [`handler_fn`] builds one without a dedicated type.

use crate::errors::{EngineError, EngineResult, HandlerResult};
use crate::event::EventContext;
use crate::types::EventTypeName;
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Validates and projects records of one event type.
///
/// # Example
///
/// ```rust,ignore
/// struct UserAdded;
///
/// #[async_trait]
/// impl EventHandler<Users> for UserAdded {
///     async fn validate(&self, ctx: &EventContext<'_, Users>) -> HandlerResult<()> {
///         let props: NewUser = ctx.props_as()?;
///         if ctx.state.contains(&props.email) {
///             return Err(HandlerError::new("Email already registered"));
///         }
///         Ok(())
///     }
///
///     async fn project(&self, ctx: &EventContext<'_, Users>) -> HandlerResult<Option<Users>> {
///         let props: NewUser = ctx.props_as()?;
///         Ok(Some(ctx.state.with(props)))
///     }
/// }
/// ```
#[async_trait]
pub trait EventHandler<S>: Send + Sync
where
    S: Send + Sync,
{
    /// Checks the event against the state it would apply to.
    ///
    /// Called twice per accepted submission: once before the append with
    /// `ctx.position == None`, and once after delivery with the committed
    /// position. Only the second call decides whether the event projects.
    async fn validate(&self, _ctx: &EventContext<'_, S>) -> HandlerResult<()> {
        Ok(())
    }

    /// Computes the state after this event.
    ///
    /// Returning `Ok(None)` leaves the state unchanged. A failure leaves the
    /// state exactly as it was before the event.
    async fn project(&self, ctx: &EventContext<'_, S>) -> HandlerResult<Option<S>>;
}

type ValidateFn<S> = dyn Fn(&EventContext<'_, S>) -> HandlerResult<()> + Send + Sync;
type ProjectFn<S> = dyn Fn(&EventContext<'_, S>) -> HandlerResult<Option<S>> + Send + Sync;

/// A handler built from synchronous closures.
pub struct FnHandler<S> {
    validate: Option<Box<ValidateFn<S>>>,
    project: Box<ProjectFn<S>>,
}

/// Builds a handler from a synchronous projection closure.
///
/// Add a validator with [`FnHandler::with_validator`].
pub fn handler_fn<S, P>(project: P) -> FnHandler<S>
where
    P: Fn(&EventContext<'_, S>) -> HandlerResult<Option<S>> + Send + Sync + 'static,
{
    FnHandler {
        validate: None,
        project: Box::new(project),
    }
}

impl<S> FnHandler<S> {
    /// Adds a synchronous validator to the handler.
    #[must_use]
    pub fn with_validator<V>(mut self, validate: V) -> Self
    where
        V: Fn(&EventContext<'_, S>) -> HandlerResult<()> + Send + Sync + 'static,
    {
        self.validate = Some(Box::new(validate));
        self
    }
}

impl<S> std::fmt::Debug for FnHandler<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnHandler")
            .field("validate", &self.validate.as_ref().map(|_| "<function>"))
            .field("project", &"<function>")
            .finish()
    }
}

#[async_trait]
impl<S> EventHandler<S> for FnHandler<S>
where
    S: Send + Sync,
{
    async fn validate(&self, ctx: &EventContext<'_, S>) -> HandlerResult<()> {
        self.validate.as_ref().map_or(Ok(()), |validate| validate(ctx))
    }

    async fn project(&self, ctx: &EventContext<'_, S>) -> HandlerResult<Option<S>> {
        (self.project)(ctx)
    }
}

type AsyncValidateFn<S> = dyn for<'c, 'e> Fn(&'c EventContext<'e, S>) -> BoxFuture<'c, HandlerResult<()>>
    + Send
    + Sync;
type AsyncProjectFn<S> = dyn for<'c, 'e> Fn(&'c EventContext<'e, S>) -> BoxFuture<'c, HandlerResult<Option<S>>>
    + Send
    + Sync;

/// A handler built from closures returning boxed futures.
pub struct AsyncFnHandler<S> {
    validate: Option<Box<AsyncValidateFn<S>>>,
    project: Box<AsyncProjectFn<S>>,
}

/// Builds a handler from an asynchronous projection closure.
///
/// ```rust,ignore
/// let handler = async_handler_fn(|ctx: &EventContext<'_, Sentence>| {
///     Box::pin(async move {
///         tokio::time::sleep(Duration::from_millis(5)).await;
///         Ok(Some(ctx.state.push(ctx.props_as::<char>()?)))
///     })
/// });
/// ```
pub fn async_handler_fn<S, P>(project: P) -> AsyncFnHandler<S>
where
    P: for<'c, 'e> Fn(&'c EventContext<'e, S>) -> BoxFuture<'c, HandlerResult<Option<S>>>
        + Send
        + Sync
        + 'static,
{
    AsyncFnHandler {
        validate: None,
        project: Box::new(project),
    }
}

impl<S> AsyncFnHandler<S> {
    /// Adds an asynchronous validator to the handler.
    #[must_use]
    pub fn with_validator<V>(mut self, validate: V) -> Self
    where
        V: for<'c, 'e> Fn(&'c EventContext<'e, S>) -> BoxFuture<'c, HandlerResult<()>>
            + Send
            + Sync
            + 'static,
    {
        self.validate = Some(Box::new(validate));
        self
    }
}

impl<S> std::fmt::Debug for AsyncFnHandler<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncFnHandler")
            .field("validate", &self.validate.as_ref().map(|_| "<function>"))
            .field("project", &"<function>")
            .finish()
    }
}

#[async_trait]
impl<S> EventHandler<S> for AsyncFnHandler<S>
where
    S: Send + Sync,
{
    async fn validate(&self, ctx: &EventContext<'_, S>) -> HandlerResult<()> {
        match &self.validate {
            Some(validate) => validate(ctx).await,
            None => Ok(()),
        }
    }

    async fn project(&self, ctx: &EventContext<'_, S>) -> HandlerResult<Option<S>> {
        (self.project)(ctx).await
    }
}

/// Thread-safe map from event type name to handler.
pub struct EventTypeRegistry<S>
where
    S: Send + Sync,
{
    handlers: RwLock<HashMap<EventTypeName, Arc<dyn EventHandler<S>>>>,
}

impl<S> EventTypeRegistry<S>
where
    S: Send + Sync,
{
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Registers `handler` for `event_type`.
    ///
    /// Fails with [`EngineError::DuplicateType`] if the type already has a
    /// handler; the existing registration is kept.
    pub fn register<H>(&self, event_type: EventTypeName, handler: H) -> EngineResult<()>
    where
        H: EventHandler<S> + 'static,
    {
        self.register_arc(event_type, Arc::new(handler))
    }

    /// Registers an already shared handler for `event_type`.
    pub fn register_arc(
        &self,
        event_type: EventTypeName,
        handler: Arc<dyn EventHandler<S>>,
    ) -> EngineResult<()> {
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&event_type) {
            return Err(EngineError::DuplicateType(event_type));
        }
        handlers.insert(event_type, handler);
        Ok(())
    }

    /// Looks up the handler for `event_type` by exact name.
    pub fn get(&self, event_type: &EventTypeName) -> Option<Arc<dyn EventHandler<S>>> {
        self.handlers.read().get(event_type).cloned()
    }

    /// Whether a handler is registered for `event_type`.
    pub fn contains(&self, event_type: &EventTypeName) -> bool {
        self.handlers.read().contains_key(event_type)
    }

    /// Returns the registered type names, sorted.
    pub fn registered_types(&self) -> Vec<EventTypeName> {
        let mut types: Vec<_> = self.handlers.read().keys().cloned().collect();
        types.sort();
        types
    }
}

impl<S> Default for EventTypeRegistry<S>
where
    S: Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<S> std::fmt::Debug for EventTypeRegistry<S>
where
    S: Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventTypeRegistry")
            .field("types", &self.registered_types())
            .finish()
    }
}
