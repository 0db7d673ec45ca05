//! Subscriber callbacks and handlers.
//!
//! Synchronous callbacks run inside `publish`. Asynchronous handlers are
//! spawned on the ambient runtime and never awaited by the publisher.

use crate::error::{BoxError, HubError};
use crate::types::{Event, Payload, SortOrder};
use async_trait::async_trait;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Return values a callback may produce.
///
/// Implemented for `()` (infallible callbacks) and for `Result<(), E>` with
/// any error convertible into [`BoxError`].
///
/// A callback whose body only panics has no return type to infer from.
/// Name the output explicitly:
///
/// ```rust
/// use latest_hub::Hub;
///
/// let hub: Hub = Hub::new();
/// hub.subscribe::<_, ()>("jobs:*", |_| panic!("not implemented"))
///     .unwrap();
/// ```
pub trait CallbackOutput {
    /// Convert into the uniform callback result.
    fn into_result(self) -> Result<(), BoxError>;
}

impl CallbackOutput for () {
    fn into_result(self) -> Result<(), BoxError> {
        Ok(())
    }
}

impl<E> CallbackOutput for Result<(), E>
where
    E: Into<BoxError>,
{
    fn into_result(self) -> Result<(), BoxError> {
        self.map_err(Into::into)
    }
}

/// Asynchronous event handler.
///
/// Handlers are spawned per delivery; a slow handler never blocks the
/// publisher or other subscribers.
#[async_trait]
pub trait EventHandler<T = Payload>: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: Arc<Event<T>>) -> Result<(), BoxError>;

    /// Name used in log lines.
    fn name(&self) -> &str {
        "anonymous"
    }
}

/// Per-subscription error handler.
///
/// Receives the `SubscriberCallback` failure and the event that caused it.
pub type ErrorHandler<T> = Arc<dyn Fn(&HubError, &Event<T>) + Send + Sync>;

pub(crate) type EventCallback<T> = Arc<dyn Fn(&Event<T>) -> Result<(), BoxError> + Send + Sync>;

pub(crate) type CombinedCallback<T> =
    Arc<dyn Fn(&[Arc<Event<T>>]) -> Result<(), BoxError> + Send + Sync>;

pub(crate) fn event_callback<T, F, R>(callback: F) -> EventCallback<T>
where
    F: Fn(&Event<T>) -> R + Send + Sync + 'static,
    R: CallbackOutput,
{
    Arc::new(move |event| callback(event).into_result())
}

pub(crate) fn combined_callback<T, F, R>(callback: F) -> CombinedCallback<T>
where
    F: Fn(&[Arc<Event<T>>]) -> R + Send + Sync + 'static,
    R: CallbackOutput,
{
    Arc::new(move |events| callback(events).into_result())
}

/// What a subscription does when it is delivered to.
pub(crate) enum Delivery<T> {
    /// Synchronous per-event callback
    Callback(EventCallback<T>),
    /// Asynchronous handler spawned per event
    Handler(Arc<dyn EventHandler<T>>),
    /// Synchronous callback over a combined view
    Combined {
        callback: CombinedCallback<T>,
        order: Option<SortOrder>,
    },
}

impl<T> Delivery<T> {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Delivery::Callback(_) => "callback",
            Delivery::Handler(_) => "handler",
            Delivery::Combined { .. } => "combined",
        }
    }
}

/// Run a synchronous callback, optionally converting a panic into an error.
pub(crate) fn invoke<F>(isolate_panics: bool, f: F) -> Result<(), BoxError>
where
    F: FnOnce() -> Result<(), BoxError>,
{
    if !isolate_panics {
        return f();
    }

    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic) => Err(format!("callback panicked: {}", panic_message(&panic)).into()),
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
