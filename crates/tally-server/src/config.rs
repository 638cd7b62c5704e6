//! Server configuration.

use std::time::Duration;

use tally_settings::ServerSettings;

use crate::session_store::DEFAULT_SESSION_TTL;
use crate::shutdown::DrainPolicy;
use crate::websocket::heartbeat::DEFAULT_HEARTBEAT_INTERVAL;

/// Runtime configuration for the tally server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` for auto-assign).
    pub port: u16,
    /// Period between heartbeat sweeps.
    pub heartbeat_interval: Duration,
    /// Lifetime of a saved session.
    pub session_ttl: Duration,
    /// Per-connection wait for in-flight work on shutdown.
    pub drain: DrainPolicy,
    /// Outbound frames buffered per connection.
    pub send_queue_capacity: usize,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Upper bound for joining background tasks on shutdown.
    pub shutdown_timeout: Duration,
}

impl ServerConfig {
    /// `host:port` string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            session_ttl: DEFAULT_SESSION_TTL,
            drain: DrainPolicy::default(),
            send_queue_capacity: 256,
            max_message_size: 64 * 1024,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&ServerSettings> for ServerConfig {
    fn from(s: &ServerSettings) -> Self {
        Self {
            host: s.host.clone(),
            port: s.port,
            heartbeat_interval: Duration::from_secs(s.heartbeat_interval_secs),
            session_ttl: Duration::from_secs(s.session_ttl_secs),
            drain: DrainPolicy {
                poll_interval: Duration::from_millis(s.drain_poll_interval_ms),
                max_attempts: s.drain_max_attempts,
            },
            send_queue_capacity: s.send_queue_capacity,
            max_message_size: s.max_message_size,
            shutdown_timeout: Duration::from_secs(s.shutdown_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_binds_loopback_on_any_port() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 0);
        assert_eq!(cfg.bind_addr(), "127.0.0.1:0");
    }

    #[test]
    fn default_timings() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(cfg.session_ttl, Duration::from_secs(300));
        assert_eq!(cfg.drain.poll_interval, Duration::from_millis(100));
        assert_eq!(cfg.drain.max_attempts, 100);
    }

    #[test]
    fn from_default_settings() {
        let cfg = ServerConfig::from(&ServerSettings::default());
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.port, 8000);
        assert_eq!(cfg.session_ttl, Duration::from_secs(300));
        assert_eq!(cfg.drain, DrainPolicy::default());
        assert_eq!(cfg.send_queue_capacity, 256);
        assert_eq!(cfg.max_message_size, 65536);
    }

    #[test]
    fn from_custom_settings() {
        let settings = ServerSettings {
            heartbeat_interval_secs: 5,
            session_ttl_secs: 60,
            drain_poll_interval_ms: 50,
            drain_max_attempts: 20,
            shutdown_timeout_secs: 3,
            ..ServerSettings::default()
        };
        let cfg = ServerConfig::from(&settings);
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(cfg.session_ttl, Duration::from_secs(60));
        assert_eq!(cfg.drain.ceiling(), Duration::from_secs(1));
        assert_eq!(cfg.shutdown_timeout, Duration::from_secs(3));
    }
}
