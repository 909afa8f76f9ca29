//! WebSocket session layer: wire protocol, connections, pool, heartbeat,
//! and the session manager that ties them together.

pub mod connection;
pub mod heartbeat;
pub mod manager;
pub mod pool;
pub mod protocol;

#[cfg(test)]
pub(crate) mod test_support;

pub use connection::{CloseReason, Connection, ConnectionReader, SessionState};
pub use heartbeat::{ConnectionState, HeartbeatMonitor, HeartbeatStats};
pub use manager::{BroadcastReport, ConnectRequest, SessionManager};
pub use pool::ConnectionPool;
pub use protocol::{MessageType, WireMessage};
