//! Error types for hub operations
//!
//! Validation errors are returned synchronously to the caller of the
//! offending operation and always fire before any state is touched.
//! Callback failures never reach the publisher; they are represented here so
//! error handlers receive a typed value.

use thiserror::Error;

/// Boxed error returned by subscriber callbacks and handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Hub error types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    /// Key or pattern is empty
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Payload is absent and the hub requires one
    #[error("Invalid payload for key '{0}': payload is required")]
    InvalidPayload(String),

    /// No invocable callback was supplied
    #[error("Invalid callback: {0}")]
    InvalidCallback(String),

    /// Key list is empty or holds an empty entry
    #[error("Invalid key list: {0}")]
    InvalidKeyList(String),

    /// A delivered callback returned an error or panicked
    #[error("Subscriber callback failed for '{key}': {message}")]
    SubscriberCallback {
        /// Key of the event being delivered
        key: String,
        /// Failure description
        message: String,
    },

    /// Operation needs an ambient tokio runtime
    #[error("Runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// The hub backing a cell or handle has been dropped
    #[error("Hub closed")]
    Closed,
}

/// Result type for hub operations.
pub type HubResult<T> = Result<T, HubError>;

impl HubError {
    /// Check if this error was raised by input validation.
    ///
    /// Validation errors guarantee that no state was mutated.
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            HubError::InvalidKey(_)
                | HubError::InvalidPayload(_)
                | HubError::InvalidCallback(_)
                | HubError::InvalidKeyList(_)
        )
    }

    /// Get a stable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            HubError::InvalidKey(_) => "INVALID_KEY",
            HubError::InvalidPayload(_) => "INVALID_PAYLOAD",
            HubError::InvalidCallback(_) => "INVALID_CALLBACK",
            HubError::InvalidKeyList(_) => "INVALID_KEY_LIST",
            HubError::SubscriberCallback { .. } => "SUBSCRIBER_CALLBACK_FAILURE",
            HubError::RuntimeUnavailable(_) => "RUNTIME_UNAVAILABLE",
            HubError::Closed => "HUB_CLOSED",
        }
    }

    pub(crate) fn callback(key: &str, error: &BoxError) -> Self {
        HubError::SubscriberCallback {
            key: key.to_string(),
            message: error.to_string(),
        }
    }
}

/// Validate a single key or pattern.
pub(crate) fn validate_key(key: &str) -> HubResult<()> {
    if key.is_empty() {
        return Err(HubError::InvalidKey("key must not be empty".to_string()));
    }
    Ok(())
}

/// Validate a list of keys or patterns.
pub(crate) fn validate_keys<K: AsRef<str>>(keys: &[K]) -> HubResult<()> {
    if keys.is_empty() {
        return Err(HubError::InvalidKeyList("key list must not be empty".to_string()));
    }
    if let Some(index) = keys.iter().position(|k| k.as_ref().is_empty()) {
        return Err(HubError::InvalidKeyList(format!("entry {index} is empty")));
    }
    Ok(())
}
