//! External services the session manager depends on.
//!
//! Each seam is an `async_trait` object so production backends and test
//! fakes plug in the same way.

pub mod auth;
pub mod chat;
pub mod family;

use std::sync::Arc;

pub use auth::{AuthValidator, Claims, JwtAuthValidator, issue_token};
pub use chat::{ChatBackend, ChatEvent, ChatKind, ChatRequest, ChatStream, EchoChatBackend};
pub use family::{FamilyRecord, FamilyService, InMemoryFamilyService};

/// The collaborators a session manager is built with.
#[derive(Clone)]
pub struct Collaborators {
    /// Token verification.
    pub auth: Arc<dyn AuthValidator>,
    /// Chat replies.
    pub chat: Arc<dyn ChatBackend>,
    /// Family membership.
    pub family: Arc<dyn FamilyService>,
}
