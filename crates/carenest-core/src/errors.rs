//! Error taxonomy for the connection layer.
//!
//! Five independent kinds, each with its own blast radius:
//!
//! - [`AuthError`]: fatal before registration; the socket is closed with a
//!   dedicated close code and never enters the pool.
//! - [`ProtocolError`]: non-fatal; the client gets an inline error status and
//!   the connection stays open.
//! - [`BackendError`]: non-fatal; a chat or family collaborator failed.
//! - [`ConnectionError`]: fatal for one connection; triggers cleanup.
//! - [`HeartbeatTimeout`]: fatal; raised by the monitor for stale connections.
//!
//! [`SessionError`] aggregates them for call sites that can see several.
//! Every error exposes a stable machine-readable `code()` used in
//! `status_update` error payloads.

use std::time::Duration;

use thiserror::Error;

/// WebSocket close codes used by the server.
pub mod close_code {
    /// Orderly disconnect requested by either side.
    pub const NORMAL: u16 = 1000;
    /// Heartbeat timeout or server shutdown.
    pub const GOING_AWAY: u16 = 1001;
    /// Unexpected server-side failure.
    pub const INTERNAL: u16 = 1011;
    /// Server is at its connection limit.
    pub const TRY_AGAIN_LATER: u16 = 1013;
    /// A newer connection for the same user replaced this one.
    pub const SUPERSEDED: u16 = 4000;
    /// The access token has expired.
    pub const TOKEN_EXPIRED: u16 = 4001;
    /// The access token is missing or cannot be verified.
    pub const TOKEN_INVALID: u16 = 4002;
    /// The token is valid but does not grant this connection.
    pub const FORBIDDEN: u16 = 4003;
}

/// Authentication or authorization failure during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No token was supplied.
    #[error("missing access token")]
    MissingToken,
    /// The token's expiry has passed.
    #[error("access token expired")]
    Expired,
    /// The token failed verification.
    #[error("invalid access token: {0}")]
    InvalidToken(String),
    /// The token subject differs from the user named in the request path.
    #[error("token subject {actual} does not match requested user {claimed}")]
    UserMismatch {
        /// User id from the request path.
        claimed: String,
        /// User id carried by the token.
        actual: String,
    },
    /// The user asked for a family context they do not belong to.
    #[error("user {user_id} is not a member of family {family_id}")]
    NotFamilyMember {
        /// Requesting user.
        user_id: String,
        /// Requested family.
        family_id: String,
    },
    /// Family membership could not be checked.
    #[error("could not verify family membership: {0}")]
    MembershipUnverified(String),
}

impl AuthError {
    /// WebSocket close code sent when rejecting the handshake.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::Expired => close_code::TOKEN_EXPIRED,
            Self::MissingToken | Self::InvalidToken(_) => close_code::TOKEN_INVALID,
            Self::UserMismatch { .. } | Self::NotFamilyMember { .. } => close_code::FORBIDDEN,
            Self::MembershipUnverified(_) => close_code::INTERNAL,
        }
    }

    /// Short close reason (close frames cap the reason at 123 bytes).
    pub fn close_reason(&self) -> &'static str {
        match self {
            Self::MissingToken => "Token missing",
            Self::Expired => "Token expired",
            Self::InvalidToken(_) => "Token invalid",
            Self::UserMismatch { .. } => "User mismatch",
            Self::NotFamilyMember { .. } => "Not a family member",
            Self::MembershipUnverified(_) => "Membership check failed",
        }
    }

    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        "AUTH_FAILED"
    }
}

/// Malformed or unacceptable client input. Never closes the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The frame is not a JSON object.
    #[error("malformed message: {0}")]
    Malformed(String),
    /// The envelope has no `type` tag.
    #[error("message is missing the `type` field")]
    MissingType,
    /// The `type` tag is outside the known set.
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    /// A binary frame did not contain UTF-8 text.
    #[error("binary frame is not valid UTF-8")]
    NotUtf8,
    /// The frame exceeds the configured size limit.
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    TooLarge {
        /// Received size in bytes.
        size: usize,
        /// Configured maximum.
        limit: usize,
    },
    /// The envelope is well formed but its payload is not.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    /// A server-to-client message type was sent by the client.
    #[error("message type `{0}` cannot be sent by clients")]
    UnsupportedDirection(String),
    /// A chat reply is still streaming on this connection.
    #[error("a chat reply is already in progress")]
    Busy,
}

impl ProtocolError {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Malformed(_) | Self::NotUtf8 => "MALFORMED_MESSAGE",
            Self::MissingType | Self::UnknownType(_) => "UNKNOWN_MESSAGE_TYPE",
            Self::TooLarge { .. } => "MESSAGE_TOO_LARGE",
            Self::InvalidPayload(_) => "INVALID_PAYLOAD",
            Self::UnsupportedDirection(_) => "UNSUPPORTED_MESSAGE",
            Self::Busy => "BUSY",
        }
    }
}

/// A chat or family collaborator failed. Surfaced to the client, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The chat backend failed to start or continue a reply.
    #[error("chat backend error: {0}")]
    Chat(String),
    /// The family service failed.
    #[error("family service error: {0}")]
    Family(String),
    /// The family service refused the request.
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl BackendError {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Chat(_) => "CHAT_BACKEND_ERROR",
            Self::Family(_) => "FAMILY_SERVICE_ERROR",
            Self::Rejected(_) => "REQUEST_REJECTED",
        }
    }
}

/// Transport-level failure on a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The socket is closed; the connection is gone.
    #[error("connection closed")]
    Closed,
    /// The outbound queue is full and the caller asked not to wait.
    #[error("outbound queue full")]
    Backpressure,
}

impl ConnectionError {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Closed => "CONNECTION_CLOSED",
            Self::Backpressure => "BACKPRESSURE",
        }
    }
}

/// A connection produced no liveness evidence within the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no heartbeat for {elapsed:?} (threshold {threshold:?})")]
pub struct HeartbeatTimeout {
    /// Time since the last liveness evidence.
    pub elapsed: Duration,
    /// Configured timeout threshold.
    pub threshold: Duration,
}

/// Any error the session layer can produce.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Handshake rejected.
    #[error(transparent)]
    Auth(#[from] AuthError),
    /// Bad client input.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// Collaborator failure.
    #[error(transparent)]
    Backend(#[from] BackendError),
    /// Transport failure.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    /// Liveness timeout.
    #[error(transparent)]
    Heartbeat(#[from] HeartbeatTimeout),
    /// The server is at its connection limit.
    #[error("server at capacity ({limit} connections)")]
    CapacityExceeded {
        /// Configured maximum.
        limit: usize,
    },
}

impl SessionError {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Auth(e) => e.code(),
            Self::Protocol(e) => e.code(),
            Self::Backend(e) => e.code(),
            Self::Connection(e) => e.code(),
            Self::Heartbeat(_) => "HEARTBEAT_TIMEOUT",
            Self::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
        }
    }

    /// Whether this error ends the affected connection.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Protocol(_) | Self::Backend(_))
    }

    /// Close code to use when this error rejects or ends a connection.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::Auth(e) => e.close_code(),
            Self::Heartbeat(_) => close_code::GOING_AWAY,
            Self::CapacityExceeded { .. } => close_code::TRY_AGAIN_LATER,
            Self::Protocol(_) | Self::Backend(_) | Self::Connection(_) => close_code::INTERNAL,
        }
    }
}
