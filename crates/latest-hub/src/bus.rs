//! Event hub implementation
//!
//! This module provides the hub: publishing, subscriber fan-out, and the
//! latest-value views derived from the latest-event registry.

use crate::cell::{Compute, LatestCell};
use crate::config::HubConfig;
use crate::error::{validate_key, validate_keys, BoxError, HubError, HubResult};
use crate::handler::{
    combined_callback, event_callback, invoke, CallbackOutput, Delivery, ErrorHandler,
    EventHandler,
};
use crate::lifecycle::{
    self, Detach, Lifetime, StopCondition, StopOn, Subscription, SubscriptionId,
};
use crate::registry::{Entry, SubscriberRegistry};
use crate::runtime;
use crate::store::LatestStore;
use crate::types::{Event, Payload, ResetOptions, SortOrder};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::watch;
use tracing::{debug, error, trace, warn};

/// Hub statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Total events published
    pub events_published: u64,
    /// Total deliveries (callback invocations and spawned handlers)
    pub events_delivered: u64,
    /// Deliveries that ended in a callback failure
    pub delivery_failures: u64,
    /// Installed subscriptions
    pub active_subscriptions: usize,
    /// Keys with a latest event
    pub stored_keys: usize,
}

/// In-process publish/subscribe hub with latest-value projection.
///
/// Dispatch is synchronous: `publish` writes the latest-event registry and
/// invokes every matching synchronous callback before returning. A publish
/// made from inside a callback updates the registry immediately but its
/// fan-out runs after the current fan-out finishes, so every subscriber
/// sees events for a key in publish order.
///
/// Clones share the same registries.
///
/// **WARNING:** a callback that captures a clone of its own hub creates an
/// `Arc` reference cycle that keeps the hub alive until the subscription is
/// removed. Unsubscribe (or `reset`) such callbacks when done.
///
/// # Example
///
/// ```rust
/// use latest_hub::Hub;
/// use serde_json::json;
///
/// let hub: Hub = Hub::new();
///
/// hub.subscribe("user:*", |event| {
///     println!("{} -> {:?}", event.key, event.data);
/// })
/// .unwrap();
///
/// hub.publish("user:login", json!({"id": 1})).unwrap();
/// assert_eq!(hub.read("user:login").unwrap().unwrap().data, Some(json!({"id": 1})));
/// ```
pub struct Hub<T = Payload> {
    inner: Arc<HubInner<T>>,
}

impl<T> Clone for Hub<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Hub<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("name", &self.inner.config.name)
            .field("subscribers", &self.inner.registry().len())
            .field("stored_keys", &self.inner.store().len())
            .finish()
    }
}

impl<T> Default for Hub<T>
where
    T: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Hub<T>
where
    T: Send + Sync + 'static,
{
    /// Create a hub with default configuration.
    pub fn new() -> Self {
        Self::with_config(HubConfig::default())
    }

    /// Create a hub with custom configuration.
    pub fn with_config(config: HubConfig) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(HubInner {
                config,
                store: RwLock::new(LatestStore::new()),
                registry: RwLock::new(SubscriberRegistry::new()),
                queue: Mutex::new(DispatchQueue::default()),
                revision,
                next_id: AtomicU64::new(1),
                events_published: AtomicU64::new(0),
                events_delivered: AtomicU64::new(0),
                delivery_failures: AtomicU64::new(0),
            }),
        }
    }

    /// Hub configuration.
    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    // ------------------------------------------------------------------
    // Publishing and reads
    // ------------------------------------------------------------------

    /// Publish an event.
    ///
    /// The event becomes the latest for `key` before any subscriber runs.
    /// Subscriber failures are never returned here.
    pub fn publish(&self, key: &str, data: T) -> HubResult<()> {
        self.inner.publish(key, Some(data))
    }

    /// Publish an event without payload.
    ///
    /// Fails with [`HubError::InvalidPayload`] when the hub requires payloads.
    pub fn signal(&self, key: &str) -> HubResult<()> {
        self.inner.publish(key, None)
    }

    /// Latest event for an exact key.
    pub fn read(&self, key: &str) -> HubResult<Option<Arc<Event<T>>>> {
        validate_key(key)?;
        Ok(self.inner.store().get(key))
    }

    /// Latest events for several keys or wildcard patterns.
    ///
    /// Keys without a latest event are omitted; each key appears once.
    pub fn read_many<K: AsRef<str>>(
        &self,
        keys: &[K],
        order: Option<SortOrder>,
    ) -> HubResult<Vec<Arc<Event<T>>>> {
        validate_keys(keys)?;
        Ok(self.inner.store().get_many(keys, order))
    }

    /// Keys that currently have a latest event, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.inner.store().keys()
    }

    /// Forget the latest event for one key.
    ///
    /// Subscribers are untouched and nothing is dispatched. Returns `true`
    /// if an event was stored.
    pub fn drop_latest(&self, key: &str) -> HubResult<bool> {
        validate_key(key)?;
        let removed = self.inner.store_mut().remove(key);
        if removed.is_some() {
            self.inner.bump_revision();
            debug!(hub = %self.inner.config.name, key = %key, "Latest event dropped");
        }
        Ok(removed.is_some())
    }

    /// Forget every latest event. Returns how many were stored.
    pub fn clear_all(&self) -> usize {
        let cleared = self.inner.store_mut().clear();
        self.inner.bump_revision();
        debug!(hub = %self.inner.config.name, events = cleared, "Latest events cleared");
        cleared
    }

    /// Clear latest events and, optionally, every subscriber.
    pub fn reset(&self, options: ResetOptions) {
        let cleared = self.inner.store_mut().clear();
        self.inner.bump_revision();

        let removed = if options.clear_subscribers {
            self.inner.registry_mut().clear()
        } else {
            Vec::new()
        };

        debug!(
            hub = %self.inner.config.name,
            events = cleared,
            subscribers = removed.len(),
            "Hub reset"
        );
    }

    // ------------------------------------------------------------------
    // Subscribing
    // ------------------------------------------------------------------

    /// Start configuring a subscription to `pattern`.
    pub fn subscription(&self, pattern: &str) -> SubscriptionBuilder<'_, T> {
        SubscriptionBuilder {
            hub: self,
            pattern: pattern.to_string(),
            delivery: None,
            on_error: None,
            once: false,
            replay_latest: false,
            stop: Vec::new(),
            lifetime: None,
        }
    }

    /// Invoke `callback` for every publish matching `pattern`.
    pub fn subscribe<F, R>(&self, pattern: &str, callback: F) -> HubResult<Subscription>
    where
        F: Fn(&Event<T>) -> R + Send + Sync + 'static,
        R: CallbackOutput,
    {
        self.subscription(pattern).callback(callback).install()
    }

    /// Invoke `callback` for the first publish matching `pattern` only.
    pub fn once<F, R>(&self, pattern: &str, callback: F) -> HubResult<Subscription>
    where
        F: Fn(&Event<T>) -> R + Send + Sync + 'static,
        R: CallbackOutput,
    {
        self.subscription(pattern).callback(callback).once().install()
    }

    /// Subscribe until a stop key is published or a stop condition reads
    /// `true`.
    ///
    /// If a condition is already `true`, nothing is installed and the
    /// returned handle is inert.
    pub fn subscribe_until<F, R, I, S>(
        &self,
        pattern: &str,
        callback: F,
        stop: I,
    ) -> HubResult<Subscription>
    where
        F: Fn(&Event<T>) -> R + Send + Sync + 'static,
        R: CallbackOutput,
        I: IntoIterator<Item = S>,
        S: Into<StopOn>,
    {
        stop.into_iter()
            .fold(self.subscription(pattern).callback(callback), |builder, s| {
                builder.until(s)
            })
            .install()
    }

    /// Spawn `handler` on the ambient runtime for every matching publish.
    pub fn subscribe_handler(
        &self,
        pattern: &str,
        handler: Arc<dyn EventHandler<T>>,
    ) -> HubResult<Subscription> {
        self.subscription(pattern).handler(handler).install()
    }

    /// Invoke `callback` with the latest event of every key once all of them
    /// have one, and again on every later update to any of them.
    pub fn combine_latest<K, F, R>(
        &self,
        keys: &[K],
        callback: F,
        options: CombineOptions<'_, T>,
    ) -> HubResult<Subscription>
    where
        K: AsRef<str>,
        F: Fn(&[Arc<Event<T>>]) -> R + Send + Sync + 'static,
        R: CallbackOutput,
    {
        validate_keys(keys)?;
        let patterns: Vec<String> = keys.iter().map(|k| k.as_ref().to_string()).collect();

        self.inner.install(Registration {
            label: patterns.join(","),
            patterns,
            delivery: Delivery::Combined {
                callback: combined_callback(callback),
                order: options.order,
            },
            on_error: options.on_error,
            once: options.once,
            replay_latest: options.replay_latest,
            stop: options.stop,
            lifetime: options.lifetime,
        })
    }

    /// Remove every subscriber registered under exactly `pattern`, or every
    /// subscriber when `None`. Returns how many were removed.
    pub fn unsubscribe_all(&self, pattern: Option<&str>) -> usize {
        let removed = match pattern {
            Some(pattern) => self.inner.registry_mut().remove_pattern(pattern),
            None => self.inner.registry_mut().clear(),
        };

        debug!(
            hub = %self.inner.config.name,
            pattern = pattern.unwrap_or("<all>"),
            removed = removed.len(),
            "Subscribers removed"
        );
        removed.len()
    }

    // ------------------------------------------------------------------
    // Derived cells
    // ------------------------------------------------------------------

    /// Cell holding the latest event for `key`.
    pub fn latest(&self, key: &str) -> HubResult<LatestCell<Option<Arc<Event<T>>>>> {
        validate_key(key)?;

        let hub = Arc::downgrade(&self.inner);
        let selected = key.to_string();
        let compute: Compute<Option<Arc<Event<T>>>> = Arc::new(move || {
            let event = hub.upgrade().and_then(|inner| inner.store().get(&selected));
            let fingerprint = event.iter().map(|e| e.sequence).collect();
            (event, fingerprint)
        });

        Ok(LatestCell::new(
            key.to_string(),
            compute,
            self.inner.revision.subscribe(),
        ))
    }

    /// Cell holding the latest events for several keys or patterns.
    ///
    /// Same selection rules as [`read_many`](Self::read_many).
    pub fn latest_many<K: AsRef<str>>(
        &self,
        keys: &[K],
        order: Option<SortOrder>,
    ) -> HubResult<LatestCell<Vec<Arc<Event<T>>>>> {
        validate_keys(keys)?;

        let hub = Arc::downgrade(&self.inner);
        let selected: Vec<String> = keys.iter().map(|k| k.as_ref().to_string()).collect();
        let label = selected.join(",");
        let compute: Compute<Vec<Arc<Event<T>>>> = Arc::new(move || {
            let events = hub
                .upgrade()
                .map(|inner| inner.store().get_many(&selected, order))
                .unwrap_or_default();
            let fingerprint = events.iter().map(|e| e.sequence).collect();
            (events, fingerprint)
        });

        Ok(LatestCell::new(label, compute, self.inner.revision.subscribe()))
    }

    /// Cell that is `Some` only while every key or pattern resolves.
    ///
    /// [`LatestCell::changed`] and reactions only report ready views. A view
    /// that stops being ready (for example after `drop_latest`) is skipped
    /// until every key resolves again.
    pub fn combined<K: AsRef<str>>(
        &self,
        keys: &[K],
        order: Option<SortOrder>,
    ) -> HubResult<LatestCell<Option<Vec<Arc<Event<T>>>>>> {
        validate_keys(keys)?;

        let hub = Arc::downgrade(&self.inner);
        let selected: Vec<String> = keys.iter().map(|k| k.as_ref().to_string()).collect();
        let label = selected.join(",");
        let compute: Compute<Option<Vec<Arc<Event<T>>>>> = Arc::new(move || {
            let events = hub
                .upgrade()
                .and_then(|inner| inner.store().get_all(&selected, order));
            let fingerprint = events
                .iter()
                .flatten()
                .map(|e| e.sequence)
                .collect();
            (events, fingerprint)
        });

        Ok(LatestCell::new(label, compute, self.inner.revision.subscribe())
            .ready_when(|view| view.is_some()))
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Number of installed subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.registry().len()
    }

    /// Hub statistics.
    pub fn stats(&self) -> HubStats {
        HubStats {
            events_published: self.inner.events_published.load(Ordering::Relaxed),
            events_delivered: self.inner.events_delivered.load(Ordering::Relaxed),
            delivery_failures: self.inner.delivery_failures.load(Ordering::Relaxed),
            active_subscriptions: self.inner.registry().len(),
            stored_keys: self.inner.store().len(),
        }
    }
}

// ============================================================================
// Subscription configuration
// ============================================================================

/// Configuration for a single subscription.
///
/// Obtained from [`Hub::subscription`]; nothing is registered until
/// [`install`](Self::install).
#[must_use = "call install() to register the subscription"]
pub struct SubscriptionBuilder<'h, T> {
    hub: &'h Hub<T>,
    pattern: String,
    delivery: Option<Delivery<T>>,
    on_error: Option<ErrorHandler<T>>,
    once: bool,
    replay_latest: bool,
    stop: Vec<StopOn>,
    lifetime: Option<&'h dyn Lifetime>,
}

impl<'h, T> SubscriptionBuilder<'h, T>
where
    T: Send + Sync + 'static,
{
    /// Deliver synchronously to `callback`.
    pub fn callback<F, R>(mut self, callback: F) -> Self
    where
        F: Fn(&Event<T>) -> R + Send + Sync + 'static,
        R: CallbackOutput,
    {
        self.delivery = Some(Delivery::Callback(event_callback(callback)));
        self
    }

    /// Deliver asynchronously to `handler`.
    pub fn handler(mut self, handler: Arc<dyn EventHandler<T>>) -> Self {
        self.delivery = Some(Delivery::Handler(handler));
        self
    }

    /// Route callback failures to `on_error` instead of the log.
    pub fn on_error<F>(mut self, on_error: F) -> Self
    where
        F: Fn(&HubError, &Event<T>) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(on_error));
        self
    }

    /// Remove the subscription right before its first delivery.
    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    /// Deliver the current latest events matching the pattern on install.
    pub fn replay_latest(mut self, replay: bool) -> Self {
        self.replay_latest = replay;
        self
    }

    /// End the subscription on a stop key or stop condition.
    pub fn until(mut self, stop: impl Into<StopOn>) -> Self {
        self.stop.push(stop.into());
        self
    }

    /// End the subscription on a stop condition.
    pub fn until_condition(self, condition: StopCondition) -> Self {
        self.until(condition)
    }

    /// Unsubscribe when `lifetime` is torn down.
    pub fn bound_to(mut self, lifetime: &'h dyn Lifetime) -> Self {
        self.lifetime = Some(lifetime);
        self
    }

    /// Validate and register the subscription.
    pub fn install(self) -> HubResult<Subscription> {
        validate_key(&self.pattern)?;
        let delivery = self.delivery.ok_or_else(|| {
            HubError::InvalidCallback("no callback or handler supplied".to_string())
        })?;

        self.hub.inner.install(Registration {
            label: self.pattern.clone(),
            patterns: vec![self.pattern],
            delivery,
            on_error: self.on_error,
            once: self.once,
            replay_latest: self.replay_latest,
            stop: self.stop,
            lifetime: self.lifetime,
        })
    }
}

/// Options for [`Hub::combine_latest`].
pub struct CombineOptions<'a, T> {
    /// Order of the events handed to the callback
    pub order: Option<SortOrder>,
    /// Evaluate against current state on registration
    pub replay_latest: bool,
    /// Remove after the first delivery
    pub once: bool,
    /// Per-subscription error handler
    pub on_error: Option<ErrorHandler<T>>,
    /// Unsubscribe when this lifetime is torn down
    pub lifetime: Option<&'a dyn Lifetime>,
    /// Stop keys and stop conditions
    pub stop: Vec<StopOn>,
}

impl<T> Default for CombineOptions<'_, T> {
    fn default() -> Self {
        Self {
            order: None,
            replay_latest: false,
            once: false,
            on_error: None,
            lifetime: None,
            stop: Vec::new(),
        }
    }
}

impl<'a, T> CombineOptions<'a, T> {
    /// Set the event order.
    pub fn with_order(mut self, order: SortOrder) -> Self {
        self.order = Some(order);
        self
    }

    /// Evaluate immediately on registration.
    pub fn with_replay(mut self) -> Self {
        self.replay_latest = true;
        self
    }

    /// Deliver at most once.
    pub fn with_once(mut self) -> Self {
        self.once = true;
        self
    }

    /// Set the error handler.
    pub fn with_error_handler<F>(mut self, on_error: F) -> Self
    where
        F: Fn(&HubError, &Event<T>) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(on_error));
        self
    }

    /// Bind to a resource lifetime.
    pub fn with_lifetime(mut self, lifetime: &'a dyn Lifetime) -> Self {
        self.lifetime = Some(lifetime);
        self
    }

    /// Add a stop key or stop condition.
    pub fn with_stop(mut self, stop: impl Into<StopOn>) -> Self {
        self.stop.push(stop.into());
        self
    }
}

/// Validated description of an entry to install.
struct Registration<'a, T> {
    label: String,
    patterns: Vec<String>,
    delivery: Delivery<T>,
    on_error: Option<ErrorHandler<T>>,
    once: bool,
    replay_latest: bool,
    stop: Vec<StopOn>,
    lifetime: Option<&'a dyn Lifetime>,
}

// ============================================================================
// Hub internals
// ============================================================================

struct DispatchQueue<T> {
    draining: bool,
    pending: VecDeque<Arc<Event<T>>>,
}

impl<T> Default for DispatchQueue<T> {
    fn default() -> Self {
        Self {
            draining: false,
            pending: VecDeque::new(),
        }
    }
}

struct HubInner<T> {
    config: HubConfig,
    store: RwLock<LatestStore<T>>,
    registry: RwLock<SubscriberRegistry<T>>,
    queue: Mutex<DispatchQueue<T>>,
    /// Bumped on every change to the latest-event registry
    revision: watch::Sender<u64>,
    next_id: AtomicU64,
    events_published: AtomicU64,
    events_delivered: AtomicU64,
    delivery_failures: AtomicU64,
}

/// Releases the dispatch queue if a callback panics through the drain loop.
struct DrainGuard<'a, T> {
    queue: &'a Mutex<DispatchQueue<T>>,
}

impl<T> Drop for DrainGuard<'_, T> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .draining = false;
        }
    }
}

impl<T> HubInner<T> {
    fn store(&self) -> RwLockReadGuard<'_, LatestStore<T>> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn store_mut(&self) -> RwLockWriteGuard<'_, LatestStore<T>> {
        self.store.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry(&self) -> RwLockReadGuard<'_, SubscriberRegistry<T>> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry_mut(&self) -> RwLockWriteGuard<'_, SubscriberRegistry<T>> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn queue(&self) -> MutexGuard<'_, DispatchQueue<T>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump_revision(&self) {
        self.revision.send_modify(|revision| *revision = revision.wrapping_add(1));
    }
}

impl<T> HubInner<T>
where
    T: Send + Sync + 'static,
{
    fn publish(self: &Arc<Self>, key: &str, data: Option<T>) -> HubResult<()> {
        validate_key(key)?;
        if data.is_none() && self.config.require_payload {
            return Err(HubError::InvalidPayload(key.to_string()));
        }

        // The queue lock covers the insert so that fan-out follows the
        // sequence order assigned by the store.
        let (event, drain) = {
            let mut queue = self.queue();
            let event = self.store_mut().insert(key, data);
            queue.pending.push_back(Arc::clone(&event));
            let drain = !queue.draining;
            queue.draining = true;
            (event, drain)
        };
        self.bump_revision();
        self.events_published.fetch_add(1, Ordering::Relaxed);

        trace!(
            hub = %self.config.name,
            key = %event.key,
            sequence = event.sequence,
            "Event published"
        );

        if drain {
            self.drain();
        } else {
            trace!(hub = %self.config.name, "Fan-out in progress, event queued");
        }
        Ok(())
    }

    /// Fan out queued events until the queue is empty.
    fn drain(self: &Arc<Self>) {
        let _guard = DrainGuard { queue: &self.queue };
        while let Some(event) = self.next_queued() {
            self.fan_out(&event);
        }
    }

    fn next_queued(&self) -> Option<Arc<Event<T>>> {
        let mut queue = self.queue();
        let next = queue.pending.pop_front();
        if next.is_none() {
            queue.draining = false;
        }
        next
    }

    fn fan_out(self: &Arc<Self>, event: &Arc<Event<T>>) {
        let (stopped, targets) = {
            let mut registry = self.registry_mut();
            let stopped = registry.take_stopped(&event.key);
            let targets = registry.matching(&event.key);
            (stopped, targets)
        };

        for entry in &stopped {
            debug!(
                hub = %self.config.name,
                key = %event.key,
                subscription_id = %entry.id,
                "Subscription stopped"
            );
        }

        if targets.is_empty() {
            trace!(hub = %self.config.name, key = %event.key, "No subscribers for event");
            return;
        }

        for entry in &targets {
            self.deliver(entry, event);
        }
    }

    fn deliver(self: &Arc<Self>, entry: &Arc<Entry<T>>, event: &Arc<Event<T>>) {
        if entry.condition_met() {
            if self.detach(entry.id) {
                debug!(
                    hub = %self.config.name,
                    subscription_id = %entry.id,
                    "Subscription stopped by condition"
                );
            }
            return;
        }

        let view = match &entry.delivery {
            Delivery::Combined { order, .. } => {
                let view = self.store().get_all(&entry.patterns, *order);
                if view.is_none() {
                    trace!(
                        hub = %self.config.name,
                        subscription_id = %entry.id,
                        "Combined view not ready"
                    );
                    return;
                }
                view
            }
            _ => None,
        };

        if !entry.begin_delivery() {
            return;
        }
        if entry.once {
            self.registry_mut().remove(entry.id);
        }

        self.events_delivered.fetch_add(1, Ordering::Relaxed);
        trace!(
            hub = %self.config.name,
            key = %event.key,
            subscription_id = %entry.id,
            kind = entry.delivery.kind(),
            "Delivering event"
        );

        let isolate = self.config.isolate_panics;
        let result = match (&entry.delivery, view) {
            (Delivery::Callback(callback), _) => invoke(isolate, || callback(event)),
            (Delivery::Combined { callback, .. }, Some(view)) => {
                invoke(isolate, || callback(&view))
            }
            (Delivery::Combined { .. }, None) => Ok(()),
            (Delivery::Handler(handler), _) => self.spawn_handler(entry, handler, event),
        };

        if let Err(error) = result {
            self.report_failure(entry, event, error);
        }
    }

    fn spawn_handler(
        self: &Arc<Self>,
        entry: &Arc<Entry<T>>,
        handler: &Arc<dyn EventHandler<T>>,
        event: &Arc<Event<T>>,
    ) -> Result<(), BoxError> {
        let hub = Arc::downgrade(self);
        let entry = Arc::clone(entry);
        let handler = Arc::clone(handler);
        let event = Arc::clone(event);

        runtime::spawn(async move {
            if let Err(error) = handler.handle(Arc::clone(&event)).await {
                if let Some(hub) = hub.upgrade() {
                    hub.report_failure(&entry, &event, error);
                }
            }
        })
        .map(|_| ())
        .map_err(|e| Box::new(e) as BoxError)
    }

    /// Route a callback failure to the subscriber's error handler, or to
    /// the log when it has none.
    fn report_failure(&self, entry: &Entry<T>, event: &Event<T>, error: BoxError) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
        let failure = HubError::callback(&event.key, &error);

        let Some(on_error) = &entry.on_error else {
            error!(
                hub = %self.config.name,
                key = %event.key,
                subscription_id = %entry.id,
                error = %failure,
                "Subscriber callback failed"
            );
            return;
        };

        warn!(
            hub = %self.config.name,
            key = %event.key,
            subscription_id = %entry.id,
            error = %failure,
            "Subscriber callback failed, routed to error handler"
        );

        let handled = invoke(self.config.isolate_panics, || {
            on_error(&failure, event);
            Ok(())
        });
        if let Err(e) = handled {
            error!(
                hub = %self.config.name,
                key = %event.key,
                subscription_id = %entry.id,
                error = %e,
                "Error handler failed"
            );
        }
    }

    fn install(self: &Arc<Self>, registration: Registration<'_, T>) -> HubResult<Subscription> {
        let mut stop_keys = Vec::new();
        let mut stop_conditions = Vec::new();
        for stop in registration.stop {
            match stop {
                StopOn::Key(pattern) => {
                    validate_key(&pattern)?;
                    stop_keys.push(pattern);
                }
                StopOn::Condition(condition) => stop_conditions.push(condition),
            }
        }

        if matches!(registration.delivery, Delivery::Handler(_)) {
            runtime::ensure_available()?;
        }

        if stop_conditions.iter().any(|condition| *condition.borrow()) {
            debug!(
                hub = %self.config.name,
                pattern = %registration.label,
                "Stop condition already met, subscription not installed"
            );
            return Ok(Subscription::inert(registration.label));
        }

        let id = SubscriptionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let kind = registration.delivery.kind();
        let mut entry = Entry::new(id, registration.patterns, registration.delivery);
        entry.on_error = registration.on_error;
        entry.once = registration.once;
        entry.stop_keys = stop_keys;
        entry.stop_conditions = stop_conditions.clone();
        let entry = Arc::new(entry);

        self.registry_mut().insert(Arc::clone(&entry));
        debug!(
            hub = %self.config.name,
            subscription_id = %id,
            pattern = %registration.label,
            kind,
            once = entry.once,
            "Subscription installed"
        );

        for condition in stop_conditions {
            self.watch_condition(&entry, condition);
        }

        let subscription = Subscription::new(id, registration.label, lifecycle::downgrade(self));
        if let Some(lifetime) = registration.lifetime {
            subscription.detach_on(lifetime);
        }

        if registration.replay_latest && entry.is_active() {
            self.replay(&entry);
        }

        Ok(subscription)
    }

    /// Remove the entry as soon as `condition` reads `true`.
    ///
    /// Without a runtime the condition is still checked on every dispatch.
    fn watch_condition(self: &Arc<Self>, entry: &Arc<Entry<T>>, mut condition: StopCondition) {
        let hub = Arc::downgrade(self);
        let id = entry.id;

        let watcher = runtime::spawn(async move {
            let stopped = condition.wait_for(|stop| *stop).await.is_ok();
            if stopped {
                if let Some(hub) = hub.upgrade() {
                    if hub.detach(id) {
                        debug!(
                            hub = %hub.config.name,
                            subscription_id = %id,
                            "Subscription stopped by condition"
                        );
                    }
                }
            }
        });

        match watcher {
            Ok(task) => entry.add_watcher(task),
            Err(_) => trace!(
                hub = %self.config.name,
                subscription_id = %id,
                "No runtime, stop condition checked on dispatch only"
            ),
        }
    }

    /// Deliver current state to a freshly installed entry.
    fn replay(self: &Arc<Self>, entry: &Arc<Entry<T>>) {
        let events: Vec<Arc<Event<T>>> = {
            let store = self.store();
            match &entry.delivery {
                Delivery::Combined { order, .. } => store
                    .get_all(&entry.patterns, *order)
                    .and_then(|view| view.into_iter().max_by_key(|e| e.sequence))
                    .into_iter()
                    .collect(),
                _ => {
                    let mut events = store.get_many(&entry.patterns, None);
                    events.sort_by_key(|e| e.sequence);
                    events
                }
            }
        };

        for event in &events {
            if !entry.is_active() {
                break;
            }
            self.deliver(entry, event);
        }
    }
}

impl<T> Detach for HubInner<T>
where
    T: Send + Sync + 'static,
{
    fn detach(&self, id: SubscriptionId) -> bool {
        let removed = self.registry_mut().remove(id);
        if removed.is_some() {
            debug!(hub = %self.config.name, subscription_id = %id, "Subscription removed");
        }
        removed.is_some()
    }

    fn is_attached(&self, id: SubscriptionId) -> bool {
        self.registry().contains(id)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::Scope;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&Event) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        (count, move |_event: &Event| {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&Event) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let inner = Arc::clone(&seen);
        (seen, move |event: &Event| {
            let value = event.data.clone().unwrap_or(Value::Null);
            inner.lock().unwrap().push(format!("{}={}", event.key, value));
        })
    }

    #[test]
    fn test_publish_then_read() {
        let hub: Hub = Hub::new();
        let before = chrono::Utc::now().timestamp_millis();

        hub.publish("user:login", json!({"id": 1})).unwrap();

        let event = hub.read("user:login").unwrap().unwrap();
        assert_eq!(event.data, Some(json!({"id": 1})));
        assert!(event.timestamp >= before);
        assert_eq!(hub.keys(), vec!["user:login".to_string()]);
    }

    #[test]
    fn test_empty_key_rejected_without_state_change() {
        let hub: Hub = Hub::new();
        let (count, callback) = counter();
        hub.subscribe("*", callback).unwrap();

        assert!(matches!(hub.publish("", json!(1)), Err(HubError::InvalidKey(_))));
        assert!(matches!(hub.subscribe("", |_| ()), Err(HubError::InvalidKey(_))));
        assert!(matches!(hub.read(""), Err(HubError::InvalidKey(_))));
        assert!(matches!(hub.drop_latest(""), Err(HubError::InvalidKey(_))));

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(hub.stats().events_published, 0);
    }

    #[test]
    fn test_required_payload() {
        let hub: Hub = Hub::with_config(HubConfig::default().with_required_payload(true));
        assert_eq!(
            hub.signal("tick"),
            Err(HubError::InvalidPayload("tick".to_string()))
        );
        assert!(hub.read("tick").unwrap().is_none());

        let lenient: Hub = Hub::new();
        lenient.signal("tick").unwrap();
        assert_eq!(lenient.read("tick").unwrap().unwrap().data, None);
    }

    #[test]
    fn test_builder_without_callback() {
        let hub: Hub = Hub::new();
        assert!(matches!(
            hub.subscription("a").install(),
            Err(HubError::InvalidCallback(_))
        ));
        // An empty pattern is reported first.
        assert!(matches!(
            hub.subscription("").install(),
            Err(HubError::InvalidKey(_))
        ));
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_wildcard_delivery_order() {
        let hub: Hub = Hub::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let patterns = [
            ("all", "*"),
            ("exact", "user:login"),
            ("prefix", "user:*"),
            ("other", "job:*"),
        ];
        for (name, pattern) in patterns {
            let order = Arc::clone(&order);
            hub.subscribe(pattern, move |_| order.lock().unwrap().push(name))
                .unwrap();
        }

        hub.publish("user:login", json!(null)).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["all", "exact", "prefix"]);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let hub: Hub = Hub::new();
        let (count, callback) = counter();
        let sub = hub.subscribe("a", callback).unwrap();

        hub.publish("a", json!(1)).unwrap();
        sub.unsubscribe();
        sub.unsubscribe();
        hub.publish("a", json!(2)).unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!sub.is_active());
    }

    #[test]
    fn test_once_delivers_exactly_once() {
        let hub: Hub = Hub::new();
        let (count, callback) = counter();
        let sub = hub.once("a", callback).unwrap();

        hub.publish("a", json!(1)).unwrap();
        hub.publish("a", json!(2)).unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!sub.is_active());
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_once_is_not_reentered() {
        let hub: Hub = Hub::new();
        let count = Arc::new(AtomicUsize::new(0));

        let inner_hub = hub.clone();
        let inner_count = Arc::clone(&count);
        hub.once("a", move |_| {
            inner_count.fetch_add(1, Ordering::SeqCst);
            inner_hub.publish("a", json!("again")).unwrap();
        })
        .unwrap();

        hub.publish("a", json!("first")).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(hub.read("a").unwrap().unwrap().data, Some(json!("again")));
    }

    #[test]
    fn test_once_unsubscribed_before_publish() {
        let hub: Hub = Hub::new();
        let (count, callback) = counter();
        let sub = hub.once("a", callback).unwrap();

        sub.unsubscribe();
        hub.publish("a", json!(1)).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_nested_publish_keeps_per_key_order() {
        let hub: Hub = Hub::new();

        let inner_hub = hub.clone();
        hub.subscribe("a", move |event| {
            if event.data == Some(json!(1)) {
                inner_hub.publish("a", json!(2)).unwrap();
                // The registry is updated immediately.
                assert_eq!(inner_hub.read("a").unwrap().unwrap().data, Some(json!(2)));
            }
        })
        .unwrap();

        let (seen, callback) = recorder();
        hub.subscribe("a", callback).unwrap();

        hub.publish("a", json!(1)).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["a=1", "a=2"]);

        // Release the cycle created by the first callback.
        hub.reset(ResetOptions::everything());
    }

    #[test]
    fn test_concurrent_publishes_fan_out_in_sequence_order() {
        let hub: Hub = Hub::new();
        let sequences = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&sequences);
        hub.subscribe("k", move |event| sink.lock().unwrap().push(event.sequence))
            .unwrap();

        let barrier = Arc::new(std::sync::Barrier::new(2));
        let workers: Vec<_> = (0..2)
            .map(|_| {
                let hub = hub.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    for i in 0..200 {
                        hub.publish("k", json!(i)).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let sequences = sequences.lock().unwrap();
        assert_eq!(sequences.len(), 400);
        assert!(sequences.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(
            hub.read("k").unwrap().unwrap().sequence,
            *sequences.last().unwrap()
        );
    }

    #[test]
    fn test_failing_subscriber_is_isolated() {
        let hub: Hub = Hub::new();
        hub.subscribe("a", |_| Err::<(), _>("nope")).unwrap();
        hub.subscribe::<_, ()>("a", |_| panic!("kaboom")).unwrap();
        let (count, callback) = counter();
        hub.subscribe("a", callback).unwrap();

        assert!(hub.publish("a", json!(1)).is_ok());
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let stats = hub.stats();
        assert_eq!(stats.events_delivered, 3);
        assert_eq!(stats.delivery_failures, 2);
    }

    #[test]
    fn test_error_handler_receives_failure() {
        let hub: Hub = Hub::new();
        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&failures);

        hub.subscription("a")
            .callback(|event: &Event| {
                if event.data == Some(json!("bad")) {
                    Err::<(), _>("bad payload")
                } else {
                    Ok(())
                }
            })
            .on_error(move |error, event| {
                sink.lock().unwrap().push((error.clone(), event.key.clone()));
            })
            .install()
            .unwrap();

        hub.publish("a", json!("good")).unwrap();
        hub.publish("a", json!("bad")).unwrap();

        let failures = failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(
            failures[0],
            (
                HubError::SubscriberCallback {
                    key: "a".to_string(),
                    message: "bad payload".to_string(),
                },
                "a".to_string()
            )
        );
    }

    #[test]
    fn test_replay_latest() {
        let hub: Hub = Hub::new();
        hub.publish("user:b", json!(2)).unwrap();
        hub.publish("user:a", json!(1)).unwrap();
        hub.publish("job:1", json!(0)).unwrap();

        let (seen, callback) = recorder();
        hub.subscription("user:*")
            .callback(callback)
            .replay_latest(true)
            .install()
            .unwrap();

        // Replayed in publish order.
        assert_eq!(*seen.lock().unwrap(), vec!["user:b=2", "user:a=1"]);
    }

    #[test]
    fn test_once_with_replay_consumes_stored_event() {
        let hub: Hub = Hub::new();
        hub.publish("a", json!(1)).unwrap();

        let (count, callback) = counter();
        let sub = hub
            .subscription("a")
            .callback(callback)
            .once()
            .replay_latest(true)
            .install()
            .unwrap();

        hub.publish("a", json!(2)).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!sub.is_active());
    }

    #[test]
    fn test_subscribe_until_stop_key() {
        let hub: Hub = Hub::new();
        let (seen, callback) = recorder();
        let sub = hub
            .subscribe_until("*", callback, ["session:end"])
            .unwrap();

        hub.publish("a", json!(1)).unwrap();
        hub.publish("session:end", json!(true)).unwrap();
        hub.publish("a", json!(2)).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["a=1"]);
        assert!(!sub.is_active());
    }

    #[test]
    fn test_subscribe_until_condition_without_runtime() {
        let hub: Hub = Hub::new();
        let (stop, condition) = watch::channel(false);
        let (count, callback) = counter();
        let sub = hub.subscribe_until("a", callback, [condition]).unwrap();

        hub.publish("a", json!(1)).unwrap();
        stop.send(true).unwrap();
        hub.publish("a", json!(2)).unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!sub.is_active());
    }

    #[test]
    fn test_subscribe_until_condition_already_true() {
        let hub: Hub = Hub::new();
        let (_stop, condition) = watch::channel(true);
        let (count, callback) = counter();
        let sub = hub.subscribe_until("a", callback, [condition]).unwrap();

        assert_eq!(sub.id(), None);
        assert_eq!(hub.subscriber_count(), 0);
        hub.publish("a", json!(1)).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_subscribe_until_condition_with_runtime() {
        let hub: Hub = Hub::new();
        let (stop, condition) = watch::channel(false);
        let (_count, callback) = counter();
        let sub = hub
            .subscription("a")
            .callback(callback)
            .until_condition(condition)
            .install()
            .unwrap();

        stop.send(true).unwrap();
        // No publish needed: the watcher removes the subscription.
        for _ in 0..50 {
            if !sub.is_active() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!sub.is_active());
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_bound_to_scope() {
        let hub: Hub = Hub::new();
        let (count, callback) = counter();
        let scope = Scope::new("panel");

        hub.subscription("a")
            .callback(callback)
            .bound_to(&scope)
            .install()
            .unwrap();

        hub.publish("a", json!(1)).unwrap();
        scope.close();
        hub.publish("a", json!(2)).unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_drop_latest_keeps_subscribers() {
        let hub: Hub = Hub::new();
        let (count, callback) = counter();
        hub.subscribe("a", callback).unwrap();

        hub.publish("a", json!(1)).unwrap();
        assert!(hub.drop_latest("a").unwrap());
        assert!(!hub.drop_latest("a").unwrap());
        assert!(hub.read("a").unwrap().is_none());
        assert_eq!(count.load(Ordering::SeqCst), 1);

        hub.publish("a", json!(2)).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_reset() {
        let hub: Hub = Hub::new();
        let (count, callback) = counter();
        hub.subscribe("*", callback).unwrap();
        hub.publish("a", json!(1)).unwrap();

        hub.reset(ResetOptions::default());
        assert!(hub.keys().is_empty());
        assert_eq!(hub.subscriber_count(), 1);

        hub.reset(ResetOptions::everything());
        assert_eq!(hub.subscriber_count(), 0);

        hub.publish("a", json!(2)).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_all_for_pattern() {
        let hub: Hub = Hub::new();
        hub.subscribe("a", |_| ()).unwrap();
        hub.subscribe("a", |_| ()).unwrap();
        let keep = hub.subscribe("a:*", |_| ()).unwrap();

        assert_eq!(hub.unsubscribe_all(Some("a")), 2);
        assert!(keep.is_active());
        assert_eq!(hub.unsubscribe_all(None), 1);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_combine_latest() {
        let hub: Hub = Hub::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);

        hub.combine_latest(
            &["x", "y"],
            move |events: &[Arc<Event>]| {
                let values: Vec<Value> = events
                    .iter()
                    .map(|e| e.data.clone().unwrap_or(Value::Null))
                    .collect();
                sink.lock().unwrap().push(values);
            },
            CombineOptions::default(),
        )
        .unwrap();

        hub.publish("x", json!(1)).unwrap();
        assert!(calls.lock().unwrap().is_empty());

        hub.publish("y", json!(2)).unwrap();
        hub.publish("x", json!(3)).unwrap();
        hub.publish("unrelated", json!(0)).unwrap();

        assert_eq!(
            *calls.lock().unwrap(),
            vec![vec![json!(1), json!(2)], vec![json!(3), json!(2)]]
        );
    }

    #[test]
    fn test_combine_latest_waits_again_after_drop() {
        let hub: Hub = Hub::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        hub.combine_latest(
            &["x", "y"],
            move |_: &[Arc<Event>]| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            CombineOptions::default(),
        )
        .unwrap();

        hub.publish("x", json!(1)).unwrap();
        hub.publish("y", json!(2)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        hub.drop_latest("y").unwrap();
        hub.publish("x", json!(3)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        hub.publish("y", json!(4)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_combine_latest_replay_and_order() {
        let hub: Hub = Hub::new();
        hub.publish("b", json!("b")).unwrap();
        hub.publish("a", json!("a")).unwrap();

        let keys = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&keys);
        hub.combine_latest(
            &["b", "a"],
            move |events: &[Arc<Event>]| {
                let names: Vec<String> = events.iter().map(|e| e.key.clone()).collect();
                sink.lock().unwrap().push(names);
            },
            CombineOptions::default()
                .with_order(SortOrder::KeyAsc)
                .with_replay(),
        )
        .unwrap();

        assert_eq!(*keys.lock().unwrap(), vec![vec!["a".to_string(), "b".to_string()]]);
    }

    #[test]
    fn test_combine_latest_rejects_bad_key_lists() {
        let hub: Hub = Hub::new();
        let empty: [&str; 0] = [];
        assert!(matches!(
            hub.combine_latest(&empty, |_: &[Arc<Event>]| (), CombineOptions::default()),
            Err(HubError::InvalidKeyList(_))
        ));
        assert!(matches!(
            hub.combine_latest(&["x", ""], |_: &[Arc<Event>]| (), CombineOptions::default()),
            Err(HubError::InvalidKeyList(_))
        ));
    }

    #[test]
    fn test_read_many() {
        let hub: Hub = Hub::new();
        hub.publish("user:a", json!(1)).unwrap();
        hub.publish("user:b", json!(2)).unwrap();
        hub.publish("job:1", json!(3)).unwrap();

        let events = hub
            .read_many(&["job:1", "user:*", "missing"], Some(SortOrder::KeyAsc))
            .unwrap();
        let keys: Vec<&str> = events.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["job:1", "user:a", "user:b"]);

        assert!(matches!(
            hub.read_many(&["a", ""], None),
            Err(HubError::InvalidKeyList(_))
        ));
    }

    #[test]
    fn test_latest_cell_reads_current_state() {
        let hub: Hub = Hub::new();
        let cell = hub.latest("a").unwrap();
        assert!(cell.get().is_none());

        hub.publish("a", json!(1)).unwrap();
        assert_eq!(cell.get().unwrap().data, Some(json!(1)));

        hub.drop_latest("a").unwrap();
        assert!(cell.get().is_none());
    }

    #[tokio::test]
    async fn test_latest_cell_changed_ignores_other_keys() {
        let hub: Hub = Hub::new();
        let mut cell = hub.latest("a").unwrap();

        hub.publish("b", json!(0)).unwrap();
        let idle = tokio::time::timeout(Duration::from_millis(20), cell.changed()).await;
        assert!(idle.is_err());

        hub.publish("a", json!(1)).unwrap();
        let event = tokio::time::timeout(Duration::from_millis(100), cell.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.unwrap().data, Some(json!(1)));
    }

    #[test]
    fn test_combined_cell_not_ready_until_all_present() {
        let hub: Hub = Hub::new();
        let cell = hub.combined(&["x", "item:*"], None).unwrap();

        hub.publish("x", json!(1)).unwrap();
        assert!(cell.get().is_none());

        hub.publish("item:1", json!(2)).unwrap();
        let events = cell.get().unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_combined_reaction_skips_views_that_are_not_ready() {
        let hub: Hub = Hub::new();
        let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
        let _reaction = hub
            .combined(&["w", "h"], None)
            .unwrap()
            .react(move |view| {
                let _ = sender.send(view.map(|events| events.len()));
            })
            .unwrap();

        hub.publish("w", json!(4)).unwrap();
        hub.publish("h", json!(3)).unwrap();
        let first = tokio::time::timeout(Duration::from_millis(100), receiver.recv()).await;
        assert_eq!(first.unwrap(), Some(Some(2)));

        hub.drop_latest("h").unwrap();
        let idle = tokio::time::timeout(Duration::from_millis(20), receiver.recv()).await;
        assert!(idle.is_err());

        hub.publish("h", json!(5)).unwrap();
        let again = tokio::time::timeout(Duration::from_millis(100), receiver.recv()).await;
        assert_eq!(again.unwrap(), Some(Some(2)));
    }

    #[test]
    fn test_latest_many_cell() {
        let hub: Hub = Hub::new();
        let cell = hub.latest_many(&["a", "b"], Some(SortOrder::TimestampDesc)).unwrap();
        assert!(cell.get().is_empty());

        hub.publish("a", json!(1)).unwrap();
        hub.publish("b", json!(2)).unwrap();
        let keys: Vec<String> = cell.get().iter().map(|e| e.key.clone()).collect();
        assert_eq!(keys, vec!["b".to_string(), "a".to_string()]);
    }

    #[tokio::test]
    async fn test_cell_closed_with_hub() {
        let hub: Hub = Hub::new();
        let mut cell = hub.latest("a").unwrap();
        drop(hub);

        assert!(cell.get().is_none());
        assert_eq!(cell.changed().await, Err(HubError::Closed));
    }

    struct Forwarder {
        sender: tokio::sync::mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl EventHandler<Value> for Forwarder {
        async fn handle(&self, event: Arc<Event>) -> Result<(), BoxError> {
            tokio::task::yield_now().await;
            if event.key == "fail" {
                return Err("handler refused".into());
            }
            self.sender.send(event.key.clone())?;
            Ok(())
        }

        fn name(&self) -> &str {
            "forwarder"
        }
    }

    #[tokio::test]
    async fn test_async_handler() {
        let hub: Hub = Hub::new();
        let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
        let failures = Arc::new(AtomicUsize::new(0));
        let failure_count = Arc::clone(&failures);

        hub.subscription("*")
            .handler(Arc::new(Forwarder { sender }))
            .on_error(move |_, _| {
                failure_count.fetch_add(1, Ordering::SeqCst);
            })
            .install()
            .unwrap();

        hub.publish("fail", json!(0)).unwrap();
        hub.publish("ok", json!(1)).unwrap();

        let key = tokio::time::timeout(Duration::from_millis(200), receiver.recv())
            .await
            .unwrap();
        assert_eq!(key.as_deref(), Some("ok"));

        for _ in 0..50 {
            if failures.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(hub.stats().delivery_failures, 1);
    }

    #[test]
    fn test_async_handler_needs_runtime() {
        let hub: Hub = Hub::new();
        let (sender, _receiver) = tokio::sync::mpsc::unbounded_channel();
        assert!(matches!(
            hub.subscribe_handler("*", Arc::new(Forwarder { sender })),
            Err(HubError::RuntimeUnavailable(_))
        ));
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_stats() {
        let hub: Hub = Hub::new();
        let stats = hub.stats();
        assert_eq!(stats, HubStats::default());

        hub.subscribe("a", |_| ()).unwrap();
        hub.publish("a", json!(1)).unwrap();
        hub.publish("b", json!(2)).unwrap();

        let stats = hub.stats();
        assert_eq!(stats.events_published, 2);
        assert_eq!(stats.events_delivered, 1);
        assert_eq!(stats.active_subscriptions, 1);
        assert_eq!(stats.stored_keys, 2);
    }
}
