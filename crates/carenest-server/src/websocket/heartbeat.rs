//! Periodic liveness monitoring.
//!
//! Each cycle snapshots the pool, reaps connections with no liveness evidence
//! within the timeout, and pings the rest. Replies to pings arrive as
//! ordinary client messages and reset the connection's heartbeat clock.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use carenest_core::{ConnectionId, HeartbeatTimeout, close_code};
use metrics::counter;
use serde::Serialize;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::connection::Connection;
use super::pool::ConnectionPool;
use super::protocol::{self, WireMessage};
use crate::metrics::{WS_HEARTBEAT_TIMEOUTS_TOTAL, WS_SEND_FAILURES_TOTAL};

/// Lifecycle state of a connection as seen by the monitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport open, credentials not yet checked.
    Connecting,
    /// Credentials accepted, not yet registered.
    Authenticated,
    /// Registered and producing liveness evidence.
    Active,
    /// Registered but silent past the timeout.
    Stale,
    /// Closed.
    Closed,
}

/// Classify a registered connection.
pub fn classify(conn: &Connection, timeout: Duration) -> ConnectionState {
    if !conn.is_active() {
        ConnectionState::Closed
    } else if conn.since_last_heartbeat() > timeout {
        ConnectionState::Stale
    } else {
        ConnectionState::Active
    }
}

/// Cumulative monitor counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HeartbeatStats {
    /// Completed cycles.
    pub cycles: u64,
    /// Pings queued.
    pub pings_sent: u64,
    /// Pings that could not be queued.
    pub ping_failures: u64,
    /// Connections reaped for silence.
    pub timeouts: u64,
}

/// Outcome of one monitor cycle.
#[derive(Debug, Default)]
pub struct CycleReport {
    /// Connections reaped for silence.
    pub reaped: Vec<ConnectionId>,
    /// Connections removed because the ping could not be delivered.
    pub failed: Vec<ConnectionId>,
    /// Pings queued.
    pub pinged: usize,
}

#[derive(Default)]
struct Counters {
    cycles: AtomicU64,
    pings_sent: AtomicU64,
    ping_failures: AtomicU64,
    timeouts: AtomicU64,
}

/// Reaps silent connections and pings the rest.
pub struct HeartbeatMonitor {
    pool: Arc<ConnectionPool>,
    interval: Duration,
    timeout: Duration,
    counters: Counters,
}

impl HeartbeatMonitor {
    /// Create a monitor over `pool`.
    pub fn new(pool: Arc<ConnectionPool>, interval: Duration, timeout: Duration) -> Self {
        Self {
            pool,
            interval,
            timeout,
            counters: Counters::default(),
        }
    }

    /// Seconds between cycles.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Silence threshold.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run one cycle over a snapshot of the pool.
    ///
    /// Connections registered or removed during the cycle are picked up by
    /// the next one.
    pub fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();
        let ping: Arc<str> = protocol::encode(&WireMessage::heartbeat_ping()).into();

        for conn in self.pool.snapshot() {
            match classify(&conn, self.timeout) {
                ConnectionState::Stale => {
                    let timeout = HeartbeatTimeout {
                        elapsed: conn.since_last_heartbeat(),
                        threshold: self.timeout,
                    };
                    warn!(
                        connection_id = %conn.id(),
                        user_id = %conn.user_id(),
                        error = %timeout,
                        "heartbeat timeout, closing connection"
                    );
                    self.evict(&conn, "Heartbeat timeout");
                    let _ = self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                    counter!(WS_HEARTBEAT_TIMEOUTS_TOTAL).increment(1);
                    report.reaped.push(conn.id().clone());
                }
                ConnectionState::Closed => {
                    let _ = self.pool.remove(conn.id());
                }
                _ => match conn.try_send_frame(ping.clone()) {
                    Ok(()) => {
                        let _ = self.counters.pings_sent.fetch_add(1, Ordering::Relaxed);
                        report.pinged += 1;
                    }
                    Err(e) => {
                        let _ = self.counters.ping_failures.fetch_add(1, Ordering::Relaxed);
                        counter!(WS_SEND_FAILURES_TOTAL).increment(1);
                        warn!(
                            connection_id = %conn.id(),
                            error = %e,
                            dropped = conn.drop_count(),
                            "ping failed, removing connection"
                        );
                        report.failed.push(conn.id().clone());
                    }
                },
            }
        }

        for id in &report.failed {
            if let Some(conn) = self.pool.get(id) {
                self.evict(&conn, "Heartbeat failed");
            }
        }

        let _ = self.counters.cycles.fetch_add(1, Ordering::Relaxed);
        report
    }

    fn evict(&self, conn: &Connection, reason: &str) {
        let _ = conn.close(close_code::GOING_AWAY, reason);
        let _ = self.pool.remove(conn.id());
    }

    /// Run cycles every `interval` until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        let _ = ticker.tick().await;
        info!(
            interval_secs = self.interval.as_secs(),
            timeout_secs = self.timeout.as_secs(),
            "heartbeat monitor started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.run_cycle();
                    if !report.reaped.is_empty() || !report.failed.is_empty() {
                        info!(
                            reaped = report.reaped.len(),
                            failed = report.failed.len(),
                            pinged = report.pinged,
                            "heartbeat cycle"
                        );
                    }
                }
                () = cancel.cancelled() => {
                    info!("heartbeat monitor stopped");
                    return;
                }
            }
        }
    }

    /// Cumulative counters.
    pub fn stats(&self) -> HeartbeatStats {
        HeartbeatStats {
            cycles: self.counters.cycles.load(Ordering::Relaxed),
            pings_sent: self.counters.pings_sent.load(Ordering::Relaxed),
            ping_failures: self.counters.ping_failures.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
        }
    }
}
