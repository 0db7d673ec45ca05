//! Background task spawning on the ambient tokio runtime.

use crate::error::{HubError, HubResult};
use std::future::Future;

/// Handle to a spawned background task. Aborting is idempotent.
#[derive(Debug)]
pub(crate) struct TaskHandle {
    #[cfg(feature = "runtime")]
    abort: tokio::task::AbortHandle,
}

impl TaskHandle {
    pub(crate) fn abort(&self) {
        #[cfg(feature = "runtime")]
        self.abort.abort();
    }

    #[cfg(feature = "runtime")]
    pub(crate) fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }

    #[cfg(not(feature = "runtime"))]
    pub(crate) fn is_finished(&self) -> bool {
        true
    }
}

/// Check whether background tasks can be spawned from here.
#[cfg(feature = "runtime")]
pub(crate) fn ensure_available() -> HubResult<()> {
    tokio::runtime::Handle::try_current()
        .map(|_| ())
        .map_err(|e| HubError::RuntimeUnavailable(e.to_string()))
}

#[cfg(not(feature = "runtime"))]
pub(crate) fn ensure_available() -> HubResult<()> {
    Err(HubError::RuntimeUnavailable(
        "built without the `runtime` feature".to_string(),
    ))
}

/// Spawn a task on the ambient runtime.
#[cfg(feature = "runtime")]
pub(crate) fn spawn<F>(future: F) -> HubResult<TaskHandle>
where
    F: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::runtime::Handle::try_current()
        .map_err(|e| HubError::RuntimeUnavailable(e.to_string()))?;
    let task = handle.spawn(future);
    Ok(TaskHandle {
        abort: task.abort_handle(),
    })
}

#[cfg(not(feature = "runtime"))]
pub(crate) fn spawn<F>(_future: F) -> HubResult<TaskHandle>
where
    F: Future<Output = ()> + Send + 'static,
{
    Err(HubError::RuntimeUnavailable(
        "built without the `runtime` feature".to_string(),
    ))
}
