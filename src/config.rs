//! Client configuration.
//!
//! Defaults suit a local service; every field can be overridden from the
//! environment:
//!
//! | Variable | Field |
//! |---|---|
//! | `LINERPC_MAX_FRAME_SIZE` | `max_frame_size` (bytes) |
//! | `LINERPC_COMPLETION_CAPACITY` | `default_completion_capacity` |
//! | `LINERPC_REQUEST_TIMEOUT_SECS` | `request_timeout_secs` |
//! | `LINERPC_TRACE_WIRE` | `trace_wire` (`1`/`true`/`yes`/`on`) |

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::MAX_FRAME_SIZE;

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Completion capacity used when the client allocates the channel itself.
const DEFAULT_COMPLETION_CAPACITY: usize = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Tunables for a [`Client`](crate::client::Client) and its codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Largest incoming frame accepted before the connection is dropped.
    pub max_frame_size: usize,
    /// Capacity of completion channels the client allocates on its own.
    pub default_completion_capacity: usize,
    /// Timeout applied by [`Client::request`](crate::client::Client::request).
    pub request_timeout_secs: u64,
    /// Log every frame at trace level on the `linerpc::wire` target.
    pub trace_wire: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            default_completion_capacity: DEFAULT_COMPLETION_CAPACITY,
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
            trace_wire: false,
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by `LINERPC_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is set to an unparsable value or
    /// a numeric setting is zero.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_env(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_env<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("LINERPC_MAX_FRAME_SIZE") {
            self.max_frame_size = parse_number("LINERPC_MAX_FRAME_SIZE", &value)?;
        }
        if let Some(value) = lookup("LINERPC_COMPLETION_CAPACITY") {
            self.default_completion_capacity =
                parse_number("LINERPC_COMPLETION_CAPACITY", &value)?;
        }
        if let Some(value) = lookup("LINERPC_REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = parse_number("LINERPC_REQUEST_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = lookup("LINERPC_TRACE_WIRE") {
            self.trace_wire = parse_flag("LINERPC_TRACE_WIRE", &value)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_size == 0 {
            return Err(ConfigError::Zero("max_frame_size"));
        }
        if self.default_completion_capacity == 0 {
            return Err(ConfigError::Zero("default_completion_capacity"));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Zero("request_timeout_secs"));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

fn parse_flag(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        }),
    }
}
