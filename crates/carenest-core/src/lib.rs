//! # carenest-core
//!
//! Shared vocabulary for the carenest real-time connection layer:
//!
//! - **Branded IDs**: `ConnectionId`, `UserId`, `FamilyId`, `MemberId`, `ConversationId`
//! - **Errors**: the auth / protocol / backend / connection / heartbeat taxonomy
//!   and WebSocket close codes
//! - **Logging**: `tracing` subscriber initialization

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod logging;

pub use errors::{
    AuthError, BackendError, ConnectionError, HeartbeatTimeout, ProtocolError, SessionError,
    close_code,
};
pub use ids::{ConnectionId, ConversationId, FamilyId, MemberId, UserId};
