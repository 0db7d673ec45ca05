//! # Latest Hub
//!
//! This crate provides an in-process publish/subscribe hub that remembers
//! the most recent event per key and exposes it as a readable value.
//!
//! ## Overview
//!
//! The latest-hub crate handles:
//! - **Publishing**: Synchronous fan-out to pattern subscribers
//! - **Latest Events**: The newest event per key, readable at any time
//! - **Combined Views**: Callbacks over the latest events of several keys
//! - **Lifecycle**: Once, stop keys, stop conditions and scoped teardown
//! - **Derived Cells**: Reactive read-only views over the latest events
//!
//! ## Features
//!
//! - `runtime` (default): Async handlers, condition watchers and reactions
//!   on the ambient Tokio runtime
//!
//! ## Usage
//!
//! ### Publishing and Subscribing
//!
//! ```rust
//! use latest_hub::Hub;
//! use serde_json::json;
//!
//! let hub: Hub = Hub::new();
//!
//! let sub = hub
//!     .subscribe("user:*", |event| println!("{}: {:?}", event.key, event.data))
//!     .unwrap();
//!
//! hub.publish("user:login", json!({"id": 1})).unwrap();
//!
//! let latest = hub.read("user:login").unwrap().unwrap();
//! assert_eq!(latest.data, Some(json!({"id": 1})));
//!
//! sub.unsubscribe();
//! ```
//!
//! ### Combining Keys
//!
//! ```rust
//! use latest_hub::{CombineOptions, Hub};
//!
//! let hub: Hub<u32> = Hub::new();
//!
//! hub.combine_latest(
//!     &["width", "height"],
//!     |events| {
//!         let area: u32 = events.iter().filter_map(|e| e.data).product();
//!         println!("area = {area}");
//!     },
//!     CombineOptions::default(),
//! )
//! .unwrap();
//!
//! hub.publish("width", 4).unwrap(); // not ready yet
//! hub.publish("height", 3).unwrap(); // area = 12
//! ```
//!
//! ### Reacting to Changes
//!
//! ```rust,no_run
//! use latest_hub::Hub;
//! use serde_json::Value;
//!
//! async fn react_example(hub: Hub<Value>) {
//!     let mut cell = hub.latest("settings:theme").unwrap();
//!
//!     while let Ok(event) = cell.changed().await {
//!         println!("theme is now {:?}", event.and_then(|e| e.data.clone()));
//!     }
//! }
//! ```
//!
//! ## Key Patterns
//!
//! Keys are plain strings, conventionally `{namespace}:{name}`:
//! - `user:login` - Exact key
//! - `user:*` - Every key in the `user` namespace, including `user:a:b`
//! - `*` - All keys
//!
//! Only the first `:` matters. `a:b:*` matches nothing but the literal key
//! `a:b:*`.

pub mod bus;
pub mod cell;
pub mod config;
pub mod error;
pub mod handler;
pub mod lifecycle;
pub mod matcher;
pub mod types;

pub(crate) mod registry;
pub(crate) mod runtime;
pub(crate) mod store;

// Re-export main types
pub use bus::{CombineOptions, Hub, HubStats, SubscriptionBuilder};
pub use cell::{LatestCell, Reaction};
pub use config::{ConfigError, HubConfig};
pub use error::{BoxError, HubError, HubResult};
pub use handler::{CallbackOutput, ErrorHandler, EventHandler};
pub use lifecycle::{Lifetime, Scope, StopCondition, StopOn, Subscription, SubscriptionId};
pub use types::{Event, Payload, ResetOptions, SortOrder};
