//! Settings type definitions.
//!
//! All types use camelCase JSON keys and `#[serde(default)]`, so a partial
//! settings file only needs the keys it overrides.

use serde::{Deserialize, Serialize};
use tally_core::logging::LogFormat;

use crate::errors::{Result, SettingsError};

/// Root settings type.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TallySettings {
    /// Listener, heartbeat, session and drain settings.
    pub server: ServerSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl TallySettings {
    /// Reject values that would make the service misbehave.
    pub fn validate(&self) -> Result<()> {
        let s = &self.server;
        let zero = [
            ("heartbeatIntervalSecs", s.heartbeat_interval_secs),
            ("sessionTtlSecs", s.session_ttl_secs),
            ("drainPollIntervalMs", s.drain_poll_interval_ms),
            ("shutdownTimeoutSecs", s.shutdown_timeout_secs),
        ]
        .into_iter()
        .find(|(_, v)| *v == 0);
        if let Some((key, _)) = zero {
            return Err(SettingsError::InvalidValue(format!("{key} must be > 0")));
        }
        if s.drain_max_attempts == 0 {
            return Err(SettingsError::InvalidValue(
                "drainMaxAttempts must be > 0".into(),
            ));
        }
        if s.send_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "sendQueueCapacity must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Server network and runtime settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listener port (`0` for auto-assign).
    pub port: u16,
    /// Seconds between heartbeat sweeps.
    pub heartbeat_interval_secs: u64,
    /// Seconds a saved session stays resumable.
    pub session_ttl_secs: u64,
    /// Milliseconds between in-flight checks while draining.
    pub drain_poll_interval_ms: u64,
    /// In-flight checks per connection before force-closing it.
    pub drain_max_attempts: u32,
    /// Outbound frames buffered per connection.
    pub send_queue_capacity: usize,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Upper bound for joining background tasks on shutdown.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            heartbeat_interval_secs: 30,
            session_ttl_secs: 300,
            drain_poll_interval_ms: 100,
            drain_max_attempts: 100,
            send_queue_capacity: 256,
            max_message_size: 64 * 1024,
            shutdown_timeout_secs: 30,
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level (`trace`..`error`), or any `EnvFilter` directive.
    pub level: String,
    /// Line format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}
