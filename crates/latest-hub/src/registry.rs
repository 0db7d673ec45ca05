//! Subscriber registry.
//!
//! Entries are owned by the registry and indexed by every pattern they were
//! registered under. Callers only ever see [`Subscription`](crate::Subscription)
//! handles.

use crate::handler::{Delivery, ErrorHandler};
use crate::lifecycle::{StopCondition, SubscriptionId};
use crate::matcher::matches;
use crate::runtime::TaskHandle;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// A registered subscriber.
pub(crate) struct Entry<T> {
    pub(crate) id: SubscriptionId,
    /// One pattern for plain subscriptions, every constituent for combined ones
    pub(crate) patterns: Vec<String>,
    pub(crate) delivery: Delivery<T>,
    pub(crate) on_error: Option<ErrorHandler<T>>,
    pub(crate) once: bool,
    pub(crate) stop_keys: Vec<String>,
    pub(crate) stop_conditions: Vec<StopCondition>,
    active: AtomicBool,
    watchers: Mutex<Vec<TaskHandle>>,
}

impl<T> Entry<T> {
    pub(crate) fn new(id: SubscriptionId, patterns: Vec<String>, delivery: Delivery<T>) -> Self {
        Self {
            id,
            patterns,
            delivery,
            on_error: None,
            once: false,
            stop_keys: Vec::new(),
            stop_conditions: Vec::new(),
            active: AtomicBool::new(true),
            watchers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Claim the right to deliver.
    ///
    /// A once-entry flips to inactive here, so exactly one caller ever wins
    /// even when deliveries race or re-enter.
    pub(crate) fn begin_delivery(&self) -> bool {
        if self.once {
            self.active
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        } else {
            self.is_active()
        }
    }

    /// Any stop condition currently reads `true`.
    pub(crate) fn condition_met(&self) -> bool {
        self.stop_conditions.iter().any(|condition| *condition.borrow())
    }

    /// A publish to `key` ends this subscription.
    pub(crate) fn stops_on(&self, key: &str) -> bool {
        self.stop_keys.iter().any(|pattern| matches(key, pattern))
            || self.condition_met()
    }

    pub(crate) fn add_watcher(&self, task: TaskHandle) {
        if !self.is_active() {
            task.abort();
            return;
        }
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    /// Mark inactive and stop background watchers.
    fn retire(&self) {
        self.active.store(false, Ordering::Release);
        let watchers = std::mem::take(
            &mut *self.watchers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for task in watchers {
            task.abort();
        }
    }
}

pub(crate) struct SubscriberRegistry<T> {
    entries: BTreeMap<SubscriptionId, Arc<Entry<T>>>,
    by_pattern: HashMap<String, Vec<SubscriptionId>>,
}

impl<T> Default for SubscriberRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SubscriberRegistry<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            by_pattern: HashMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, entry: Arc<Entry<T>>) {
        for pattern in &entry.patterns {
            let ids = self.by_pattern.entry(pattern.clone()).or_default();
            if !ids.contains(&entry.id) {
                ids.push(entry.id);
            }
        }
        self.entries.insert(entry.id, entry);
    }

    pub(crate) fn contains(&self, id: SubscriptionId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Remove one entry. Removing an unknown ID returns `None`.
    pub(crate) fn remove(&mut self, id: SubscriptionId) -> Option<Arc<Entry<T>>> {
        let entry = self.entries.remove(&id)?;
        for pattern in &entry.patterns {
            if let Some(ids) = self.by_pattern.get_mut(pattern) {
                ids.retain(|other| *other != id);
                if ids.is_empty() {
                    self.by_pattern.remove(pattern);
                }
            }
        }
        entry.retire();
        Some(entry)
    }

    /// Remove every entry registered under exactly this pattern.
    ///
    /// A combined entry listing the pattern among its constituents is
    /// removed in full.
    pub(crate) fn remove_pattern(&mut self, pattern: &str) -> Vec<Arc<Entry<T>>> {
        let ids = self.by_pattern.get(pattern).cloned().unwrap_or_default();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    pub(crate) fn clear(&mut self) -> Vec<Arc<Entry<T>>> {
        self.by_pattern.clear();
        let entries: Vec<Arc<Entry<T>>> = std::mem::take(&mut self.entries).into_values().collect();
        for entry in &entries {
            entry.retire();
        }
        entries
    }

    /// Entries with a pattern matching `key`, in registration order.
    ///
    /// An entry matching through several patterns appears once.
    pub(crate) fn matching(&self, key: &str) -> Vec<Arc<Entry<T>>> {
        let ids: BTreeSet<SubscriptionId> = self
            .by_pattern
            .iter()
            .filter(|(pattern, _)| matches(key, pattern))
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect();

        ids.into_iter()
            .filter_map(|id| self.entries.get(&id).cloned())
            .collect()
    }

    /// Remove and return every entry that a publish to `key` ends.
    pub(crate) fn take_stopped(&mut self, key: &str) -> Vec<Arc<Entry<T>>> {
        let stopped: Vec<SubscriptionId> = self
            .entries
            .values()
            .filter(|entry| entry.stops_on(key))
            .map(|entry| entry.id)
            .collect();

        stopped.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
