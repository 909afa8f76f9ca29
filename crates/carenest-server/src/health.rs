//! `/ws/health` and `/ws/stats` response bodies.

use std::collections::BTreeMap;

use carenest_core::{ConnectionId, ConversationId, FamilyId, MemberId, UserId};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::websocket::heartbeat::HeartbeatStats;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"healthy"` while the server is running.
    pub status: String,
    /// Registered connection count.
    pub active_connections: usize,
    /// Seconds since the session manager started.
    pub uptime_secs: u64,
    /// Response time.
    pub timestamp: DateTime<Utc>,
}

/// Build a health response from live counters.
pub fn health_check(active_connections: usize, uptime_secs: u64) -> HealthResponse {
    HealthResponse {
        status: "healthy".into(),
        active_connections,
        uptime_secs,
        timestamp: Utc::now(),
    }
}

/// One registered session as reported by `/ws/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    /// Connection ID.
    pub connection_id: ConnectionId,
    /// User ID.
    #[serde(skip)]
    pub user_id: UserId,
    /// Family the user connected with.
    pub family_id: Option<FamilyId>,
    /// When the connection was established.
    pub connected_at: DateTime<Utc>,
    /// Last liveness evidence.
    pub last_activity: DateTime<Utc>,
    /// Member profile being acted for.
    pub active_member_id: Option<MemberId>,
    /// Current conversation.
    pub conversation_id: Option<ConversationId>,
}

/// Stats response body.
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    /// Registered connection count.
    pub total_connections: usize,
    /// Response time.
    pub timestamp: DateTime<Utc>,
    /// Sessions keyed by user ID.
    pub sessions: BTreeMap<UserId, SessionSnapshot>,
    /// Heartbeat monitor counters.
    pub heartbeat: HeartbeatStats,
}

/// Build a stats response from session snapshots.
pub fn stats(snapshots: Vec<SessionSnapshot>, heartbeat: HeartbeatStats) -> StatsResponse {
    let sessions: BTreeMap<_, _> = snapshots
        .into_iter()
        .map(|s| (s.user_id.clone(), s))
        .collect();
    StatsResponse {
        total_connections: sessions.len(),
        timestamp: Utc::now(),
        sessions,
        heartbeat,
    }
}
