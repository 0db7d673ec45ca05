//! Latest-event registry.
//!
//! Holds at most one event per exact key. Validation is the caller's job;
//! the store itself never fails.

use crate::matcher::{is_pattern, matches};
use crate::types::{Event, SortOrder};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub(crate) struct LatestStore<T> {
    events: HashMap<String, Arc<Event<T>>>,
    last_timestamp: i64,
    last_sequence: u64,
}

impl<T> Default for LatestStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LatestStore<T> {
    pub(crate) fn new() -> Self {
        Self {
            events: HashMap::new(),
            last_timestamp: i64::MIN,
            last_sequence: 0,
        }
    }

    /// Stamp a new event and make it the latest for its key.
    pub(crate) fn insert(&mut self, key: &str, data: Option<T>) -> Arc<Event<T>> {
        let timestamp = Utc::now().timestamp_millis().max(self.last_timestamp);
        self.last_timestamp = timestamp;
        self.last_sequence += 1;

        let event = Arc::new(Event::new(
            key.to_string(),
            data,
            timestamp,
            self.last_sequence,
        ));
        self.events.insert(key.to_string(), Arc::clone(&event));
        event
    }

    pub(crate) fn get(&self, key: &str) -> Option<Arc<Event<T>>> {
        self.events.get(key).cloned()
    }

    /// Union of the events selected by each entry, de-duplicated by key.
    ///
    /// Exact entries are looked up directly. Wildcard entries expand against
    /// every stored key in key order. Without a sort order the result keeps
    /// first-seen order.
    pub(crate) fn get_many<K: AsRef<str>>(
        &self,
        keys: &[K],
        order: Option<SortOrder>,
    ) -> Vec<Arc<Event<T>>> {
        let mut seen = HashSet::new();
        let mut found = Vec::new();

        for entry in keys.iter().map(AsRef::as_ref) {
            if is_pattern(entry) {
                for key in self.matching_keys(entry) {
                    if seen.insert(key) {
                        if let Some(event) = self.events.get(key) {
                            found.push(Arc::clone(event));
                        }
                    }
                }
            } else if let Some(event) = self.events.get(entry) {
                if seen.insert(event.key.as_str()) {
                    found.push(Arc::clone(event));
                }
            }
        }

        if let Some(order) = order {
            order.sort(&mut found);
        }
        found
    }

    /// Like [`get_many`](Self::get_many), but only when every entry resolves.
    ///
    /// An exact entry resolves when its key is stored; a wildcard entry
    /// resolves when at least one stored key matches it.
    pub(crate) fn get_all<K: AsRef<str>>(
        &self,
        keys: &[K],
        order: Option<SortOrder>,
    ) -> Option<Vec<Arc<Event<T>>>> {
        let ready = keys.iter().map(AsRef::as_ref).all(|entry| {
            if is_pattern(entry) {
                self.events.keys().any(|key| matches(key, entry))
            } else {
                self.events.contains_key(entry)
            }
        });

        ready.then(|| self.get_many(keys, order))
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<Arc<Event<T>>> {
        self.events.remove(key)
    }

    pub(crate) fn clear(&mut self) -> usize {
        let count = self.events.len();
        self.events.clear();
        count
    }

    pub(crate) fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.events.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }

    fn matching_keys(&self, pattern: &str) -> Vec<&str> {
        let mut keys: Vec<&str> = self
            .events
            .keys()
            .map(String::as_str)
            .filter(|key| matches(key, pattern))
            .collect();
        keys.sort_unstable();
        keys
    }
}
