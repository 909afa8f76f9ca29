//! Server configuration.

use std::time::Duration;

use carenest_settings::CarenestSettings;
use serde::{Deserialize, Serialize};

/// Configuration for the carenest server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Seconds without liveness evidence before a connection is reaped.
    pub heartbeat_timeout_secs: u64,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Outbound frames buffered per connection.
    pub send_queue_capacity: usize,
    /// Upper bound on graceful shutdown, in seconds.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 1000,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 150,
            max_message_size: 1024 * 1024,
            send_queue_capacity: 256,
            shutdown_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    /// Heartbeat interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Heartbeat timeout.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// Graceful shutdown bound.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl From<&CarenestSettings> for ServerConfig {
    fn from(settings: &CarenestSettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            max_connections: settings.server.max_connections,
            heartbeat_interval_secs: settings.heartbeat.interval_secs,
            heartbeat_timeout_secs: settings.heartbeat.timeout_secs,
            max_message_size: settings.server.max_message_size,
            send_queue_capacity: settings.server.send_queue_capacity,
            shutdown_timeout_secs: settings.server.shutdown_timeout_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 0);
        assert_eq!(cfg.max_connections, 1000);
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(cfg.heartbeat_timeout(), Duration::from_secs(150));
        assert_eq!(cfg.send_queue_capacity, 256);
    }

    #[test]
    fn from_settings() {
        let mut settings = CarenestSettings::default();
        settings.server.port = 9000;
        settings.heartbeat.interval_secs = 5;
        settings.heartbeat.timeout_secs = 25;
        settings.server.shutdown_timeout_secs = 3;

        let cfg = ServerConfig::from(&settings);
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.heartbeat_interval_secs, 5);
        assert_eq!(cfg.heartbeat_timeout_secs, 25);
        assert_eq!(cfg.shutdown_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn serde_roundtrip() {
        let cfg = ServerConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: ServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.host, cfg.host);
        assert_eq!(back.max_message_size, cfg.max_message_size);
    }
}
