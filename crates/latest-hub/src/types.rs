//! Event types stored and delivered by the hub.

use crate::matcher::DELIMITER;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Default payload type.
pub type Payload = serde_json::Value;

/// Published event.
///
/// Events are immutable. A new publish to the same key replaces the stored
/// `Arc<Event>`; callbacks still holding the previous one keep a valid value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event<T = Payload> {
    /// Unique event ID
    pub id: Uuid,

    /// Exact key the event was published under (never a pattern)
    pub key: String,

    /// Producer-defined payload, absent for bare signals
    pub data: Option<T>,

    /// Milliseconds since the Unix epoch, never decreasing within a hub
    pub timestamp: i64,

    /// Publish sequence number, strictly increasing within a hub
    pub sequence: u64,
}

impl<T> Event<T> {
    pub(crate) fn new(key: String, data: Option<T>, timestamp: i64, sequence: u64) -> Self {
        Self {
            id: Uuid::now_v7(),
            key,
            data,
            timestamp,
            sequence,
        }
    }

    /// Borrow the payload, if any.
    pub fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    /// Timestamp as a `DateTime`.
    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }

    /// The part of the key before the first delimiter.
    ///
    /// `user:login` has segment `user`; a key without a delimiter is its own
    /// segment.
    pub fn segment(&self) -> &str {
        self.key
            .split_once(DELIMITER)
            .map_or(self.key.as_str(), |(head, _)| head)
    }
}

impl Event<Payload> {
    /// Parse the payload into a specific type.
    ///
    /// An absent payload is parsed from JSON `null`.
    pub fn parse_data<D: DeserializeOwned>(&self) -> Result<D, serde_json::Error> {
        match &self.data {
            Some(value) => D::deserialize(value),
            None => D::deserialize(serde_json::Value::Null),
        }
    }
}

/// Sort order for multi-key reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Most recent first; ties broken by publish sequence
    TimestampDesc,
    /// Lexicographic by key, ascending
    KeyAsc,
}

impl SortOrder {
    /// Sort events in place.
    pub fn sort<T>(self, events: &mut [Arc<Event<T>>]) {
        match self {
            SortOrder::TimestampDesc => events.sort_by(|a, b| {
                b.timestamp
                    .cmp(&a.timestamp)
                    .then_with(|| b.sequence.cmp(&a.sequence))
            }),
            SortOrder::KeyAsc => events.sort_by(|a, b| a.key.cmp(&b.key)),
        }
    }
}

/// Options for [`Hub::reset`](crate::Hub::reset).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetOptions {
    /// Also remove every subscriber
    pub clear_subscribers: bool,
}

impl ResetOptions {
    /// Reset latest events and subscribers.
    pub fn everything() -> Self {
        Self {
            clear_subscribers: true,
        }
    }
}
