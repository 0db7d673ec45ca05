//! Hub configuration.
//!
//! Configuration is plain data with sensible defaults; it can also be loaded
//! from environment variables.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Error message.
        message: String,
    },
}

/// Hub configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Name reported in every log line emitted by the hub.
    pub name: String,

    /// Reject publishes that carry no payload.
    pub require_payload: bool,

    /// Catch panics raised by synchronous callbacks and treat them as
    /// callback failures.
    pub isolate_panics: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            name: "latest-hub".to_string(),
            require_payload: false,
            isolate_panics: true,
        }
    }
}

impl HubConfig {
    /// Create a default configuration with the given hub name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Require a payload on every publish.
    pub fn with_required_payload(mut self, required: bool) -> Self {
        self.require_payload = required;
        self
    }

    /// Enable or disable panic isolation for synchronous callbacks.
    pub fn with_panic_isolation(mut self, isolate: bool) -> Self {
        self.isolate_panics = isolate;
        self
    }

    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `LATEST_HUB_NAME`: hub name (default: latest-hub)
    /// - `LATEST_HUB_REQUIRE_PAYLOAD`: reject absent payloads (default: false)
    /// - `LATEST_HUB_ISOLATE_PANICS`: catch callback panics (default: true)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let default = Self::default();

        Ok(Self {
            name: lookup("LATEST_HUB_NAME")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(default.name),
            require_payload: match lookup("LATEST_HUB_REQUIRE_PAYLOAD") {
                Some(value) => parse_flag("LATEST_HUB_REQUIRE_PAYLOAD", &value)?,
                None => default.require_payload,
            },
            isolate_panics: match lookup("LATEST_HUB_ISOLATE_PANICS") {
                Some(value) => parse_flag("LATEST_HUB_ISOLATE_PANICS", &value)?,
                None => default.isolate_panics,
            },
        })
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got '{}'", other),
        }),
    }
}
