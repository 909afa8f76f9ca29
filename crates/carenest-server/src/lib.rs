//! # carenest-server
//!
//! Real-time connection layer for the carenest family health assistant.
//!
//! - `WebSocket` endpoint `/ws/chat/{user_id}`: token handshake, one live
//!   connection per user, streamed chat replies, family fan-out
//! - Heartbeat monitor that pings clients and reaps stale connections
//! - HTTP endpoints: `/ws/health`, `/ws/stats`, `/metrics`
//! - Pluggable collaborators for auth, chat, and family membership
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod collaborators;
pub mod config;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;
