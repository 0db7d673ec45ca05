//! Derived latest-value cells.
//!
//! A cell is a read-only view recomputed from the latest-event registry.
//! Reads are always current. [`LatestCell::changed`] resolves only when the
//! events the cell selects differ from the ones it last reported, so
//! publishes to unrelated keys never wake it.

use crate::error::{HubError, HubResult};
use crate::runtime::{self, TaskHandle};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Sequence numbers of the events a computed value was built from.
pub(crate) type Fingerprint = Vec<u64>;

pub(crate) type Compute<V> = Arc<dyn Fn() -> (V, Fingerprint) + Send + Sync>;

/// Values failing this check are never reported by [`LatestCell::changed`].
pub(crate) type Ready<V> = fn(&V) -> bool;

/// Read-only derived cell over the latest-event registry.
pub struct LatestCell<V> {
    label: String,
    compute: Compute<V>,
    revisions: watch::Receiver<u64>,
    seen: Fingerprint,
    ready: Option<Ready<V>>,
}

impl<V> Clone for LatestCell<V> {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            compute: Arc::clone(&self.compute),
            revisions: self.revisions.clone(),
            seen: self.seen.clone(),
            ready: self.ready,
        }
    }
}

impl<V> fmt::Debug for LatestCell<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LatestCell")
            .field("label", &self.label)
            .field("seen", &self.seen)
            .finish()
    }
}

impl<V> LatestCell<V> {
    pub(crate) fn new(
        label: String,
        compute: Compute<V>,
        revisions: watch::Receiver<u64>,
    ) -> Self {
        let (_, seen) = compute();
        Self {
            label,
            compute,
            revisions,
            seen,
            ready: None,
        }
    }

    /// Skip values that are not ready when waiting for changes.
    ///
    /// The last reported fingerprint is kept while the value is not ready,
    /// so returning to the same events is not a change.
    pub(crate) fn ready_when(mut self, ready: Ready<V>) -> Self {
        self.ready = Some(ready);
        self
    }

    /// What the cell selects, e.g. `user:login` or `x,y`.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Current value.
    pub fn get(&self) -> V {
        (self.compute)().0
    }

    /// Wait until the selected events change, then return the new value.
    ///
    /// Fails with [`HubError::Closed`] once the hub is dropped.
    pub async fn changed(&mut self) -> HubResult<V> {
        loop {
            self.revisions
                .changed()
                .await
                .map_err(|_| HubError::Closed)?;

            let (value, fingerprint) = (self.compute)();
            if self.ready.is_some_and(|ready| !ready(&value)) {
                continue;
            }
            if fingerprint != self.seen {
                self.seen = fingerprint;
                return Ok(value);
            }
        }
    }
}

impl<V> LatestCell<V>
where
    V: Send + 'static,
{
    /// Run `reaction` on the ambient runtime every time the cell changes.
    ///
    /// The reaction runs until [`Reaction::stop`] is called, the returned
    /// handle is dropped, or the hub goes away.
    pub fn react<F>(mut self, mut reaction: F) -> HubResult<Reaction>
    where
        F: FnMut(V) + Send + 'static,
    {
        let label = self.label.clone();
        let task = runtime::spawn(async move {
            while let Ok(value) = self.changed().await {
                reaction(value);
            }
            debug!(cell = %self.label, "Reaction finished");
        })?;

        debug!(cell = %label, "Reaction started");
        Ok(Reaction { label, task })
    }
}

/// Running side effect attached to a cell.
#[must_use = "dropping a Reaction stops it"]
pub struct Reaction {
    label: String,
    task: TaskHandle,
}

impl fmt::Debug for Reaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reaction")
            .field("label", &self.label)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Reaction {
    /// Stop the reaction. A side effect already running completes.
    pub fn stop(&self) {
        self.task.abort();
    }

    /// Check if the reaction is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for Reaction {
    fn drop(&mut self) {
        self.task.abort();
    }
}
