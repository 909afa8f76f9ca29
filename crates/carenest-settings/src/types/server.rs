//! Server, heartbeat, auth, and logging settings.

use serde::{Deserialize, Serialize};

/// Network, capacity, and queueing settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` auto-assigns).
    pub port: u16,
    /// Maximum concurrent WebSocket sessions.
    pub max_connections: usize,
    /// Outbound frames buffered per connection before senders wait.
    pub send_queue_capacity: usize,
    /// Largest inbound frame accepted, in bytes.
    pub max_message_size: usize,
    /// Upper bound on graceful shutdown, in seconds.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            max_connections: 1000,
            send_queue_capacity: 256,
            max_message_size: 1024 * 1024,
            shutdown_timeout_secs: 10,
        }
    }
}

/// Liveness monitoring settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatSettings {
    /// Seconds between monitor cycles (and server pings).
    pub interval_secs: u64,
    /// Seconds without liveness evidence before a connection is reaped.
    pub timeout_secs: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            timeout_secs: 150,
        }
    }
}

/// Access-token verification settings.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// HMAC secret for HS256 tokens.
    pub jwt_secret: String,
    /// Clock skew tolerated on `exp`, in seconds.
    pub leeway_secs: u64,
    /// Required `iss` claim, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
}

impl std::fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSettings")
            .field("jwt_secret", &"<redacted>")
            .field("leeway_secs", &self.leeway_secs)
            .field("issuer", &self.issuer)
            .finish()
    }
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            leeway_secs: 30,
            issuer: None,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults() {
        let s = ServerSettings::default();
        assert_eq!(s.host, "127.0.0.1");
        assert_eq!(s.port, 8080);
        assert_eq!(s.max_connections, 1000);
        assert_eq!(s.send_queue_capacity, 256);
        assert_eq!(s.max_message_size, 1024 * 1024);
    }

    #[test]
    fn auth_debug_redacts_secret() {
        let auth = AuthSettings {
            jwt_secret: "hunter2".into(),
            ..AuthSettings::default()
        };
        let debug = format!("{auth:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("redacted"));
    }

    #[test]
    fn logging_defaults() {
        let l = LoggingSettings::default();
        assert_eq!(l.level, "info");
        assert!(!l.json);
    }
}
