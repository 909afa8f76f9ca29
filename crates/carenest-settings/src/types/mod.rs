//! Settings type definitions.
//!
//! Field names are camelCase on the wire. Every section implements
//! [`Default`] with production values and is `#[serde(default)]`, so partial
//! JSON files are accepted.

mod server;

pub use server::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 9000 },
///   "heartbeat": { "intervalSecs": 10, "timeoutSecs": 50 }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CarenestSettings {
    /// Network and capacity settings.
    pub server: ServerSettings,
    /// Liveness monitoring.
    pub heartbeat: HeartbeatSettings,
    /// Token verification.
    pub auth: AuthSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl CarenestSettings {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat.interval_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "heartbeat.intervalSecs must be greater than zero".into(),
            ));
        }
        if self.heartbeat.interval_secs >= self.heartbeat.timeout_secs {
            return Err(SettingsError::InvalidValue(format!(
                "heartbeat.intervalSecs ({}) must be below heartbeat.timeoutSecs ({})",
                self.heartbeat.interval_secs, self.heartbeat.timeout_secs
            )));
        }
        if self.server.max_connections == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxConnections must be greater than zero".into(),
            ));
        }
        if self.server.send_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "server.sendQueueCapacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
