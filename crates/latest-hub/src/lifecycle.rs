//! Subscription lifecycle: handles, resource lifetimes and stop conditions.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::watch;
use tracing::debug;

/// Registration handle for a subscription.
///
/// IDs increase with registration order within a hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw numeric value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Boolean condition that ends a subscription once it reads `true`.
pub type StopCondition = watch::Receiver<bool>;

/// Something that ends a subscription.
#[derive(Debug, Clone)]
pub enum StopOn {
    /// The next publish matching this pattern
    Key(String),
    /// The condition becoming `true`
    Condition(StopCondition),
}

impl From<&str> for StopOn {
    fn from(pattern: &str) -> Self {
        StopOn::Key(pattern.to_string())
    }
}

impl From<String> for StopOn {
    fn from(pattern: String) -> Self {
        StopOn::Key(pattern)
    }
}

impl From<StopCondition> for StopOn {
    fn from(condition: StopCondition) -> Self {
        StopOn::Condition(condition)
    }
}

/// Resource-lifetime collaborator.
///
/// Implementors must run every registered callback exactly once when the
/// resource is torn down. A callback registered after teardown runs
/// immediately.
pub trait Lifetime: Send + Sync {
    /// Register a teardown callback.
    fn on_teardown(&self, callback: Box<dyn FnOnce() + Send>);
}

type Teardown = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct ScopeState {
    closed: bool,
    callbacks: Vec<Teardown>,
}

/// A resource lifetime closed explicitly or on drop.
///
/// # Example
///
/// ```rust
/// use latest_hub::{Hub, Scope};
///
/// let hub: Hub = Hub::new();
/// let scope = Scope::new("settings-panel");
///
/// hub.subscription("settings:*")
///     .callback(|event| println!("{}", event.key))
///     .bound_to(&scope)
///     .install()
///     .unwrap();
///
/// assert_eq!(hub.subscriber_count(), 1);
/// drop(scope);
/// assert_eq!(hub.subscriber_count(), 0);
/// ```
pub struct Scope {
    name: String,
    state: Mutex<ScopeState>,
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Scope")
            .field("name", &self.name)
            .field("closed", &state.closed)
            .field("pending", &state.callbacks.len())
            .finish()
    }
}

impl Scope {
    /// Create an open scope.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(ScopeState::default()),
        }
    }

    /// Scope name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if the scope has been torn down.
    pub fn is_closed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }

    /// Tear the scope down, running every pending callback once.
    ///
    /// Closing an already-closed scope does nothing.
    pub fn close(&self) {
        let callbacks = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.callbacks)
        };

        debug!(scope = %self.name, callbacks = callbacks.len(), "Scope closed");
        for callback in callbacks {
            callback();
        }
    }
}

impl Lifetime for Scope {
    fn on_teardown(&self, callback: Box<dyn FnOnce() + Send>) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if !state.closed {
                state.callbacks.push(callback);
                return;
            }
        }
        callback();
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        self.close();
    }
}

/// Hub side of a subscription handle.
pub(crate) trait Detach: Send + Sync {
    /// Remove the subscription. Returns `true` if it was still installed.
    fn detach(&self, id: SubscriptionId) -> bool;

    /// Check if the subscription is still installed.
    fn is_attached(&self, id: SubscriptionId) -> bool;
}

/// Opaque unsubscribe capability.
///
/// Dropping the handle does not unsubscribe. Clones control the same
/// subscription.
#[derive(Clone)]
pub struct Subscription {
    id: Option<SubscriptionId>,
    pattern: String,
    hub: Option<Weak<dyn Detach>>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Subscription {
    pub(crate) fn new(id: SubscriptionId, pattern: String, hub: Weak<dyn Detach>) -> Self {
        Self {
            id: Some(id),
            pattern,
            hub: Some(hub),
        }
    }

    /// A handle for a subscription that was never installed.
    pub(crate) fn inert(pattern: String) -> Self {
        Self {
            id: None,
            pattern,
            hub: None,
        }
    }

    /// Subscription ID, `None` for a subscription that was never installed.
    pub fn id(&self) -> Option<SubscriptionId> {
        self.id
    }

    /// Pattern the subscription was registered under.
    ///
    /// Combined subscriptions report their keys joined with `,`.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Check if the subscription is still installed.
    pub fn is_active(&self) -> bool {
        match (self.id, self.hub.as_ref().and_then(Weak::upgrade)) {
            (Some(id), Some(hub)) => hub.is_attached(id),
            _ => false,
        }
    }

    /// Remove the subscription.
    ///
    /// Idempotent: unsubscribing twice, or after the hub is gone, is a no-op.
    /// An invocation already in progress is not interrupted.
    pub fn unsubscribe(&self) {
        if let (Some(id), Some(hub)) = (self.id, self.hub.as_ref().and_then(Weak::upgrade)) {
            hub.detach(id);
        }
    }

    pub(crate) fn detach_on(&self, lifetime: &dyn Lifetime) {
        let handle = self.clone();
        lifetime.on_teardown(Box::new(move || handle.unsubscribe()));
    }
}

pub(crate) fn downgrade<D: Detach + 'static>(hub: &Arc<D>) -> Weak<dyn Detach> {
    let hub: Arc<dyn Detach> = Arc::clone(hub) as Arc<dyn Detach>;
    Arc::downgrade(&hub)
}
