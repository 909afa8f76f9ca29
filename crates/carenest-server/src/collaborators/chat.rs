//! Chat backend seam.
//!
//! The session manager hands each chat request to a [`ChatBackend`] and
//! relays the resulting event stream to the client as `chat_stream` frames.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use carenest_core::{BackendError, ConversationId, FamilyId, MemberId, UserId};
use futures::Stream;
use uuid::Uuid;

/// Which assistant a chat request is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChatKind {
    /// Health-topic assistant.
    Health,
    /// General assistant.
    General,
}

/// A chat turn submitted by a client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatRequest {
    /// Requesting user.
    pub user_id: UserId,
    /// Family the user connected with.
    pub family_id: Option<FamilyId>,
    /// Member profile the user is acting for.
    pub active_member_id: Option<MemberId>,
    /// Existing conversation to continue, if any.
    pub conversation_id: Option<ConversationId>,
    /// Assistant kind.
    pub kind: ChatKind,
    /// User's message text.
    pub message: String,
}

/// One item of a streamed chat reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChatEvent {
    /// A chunk of reply text.
    Delta(String),
    /// The reply is complete.
    Done {
        /// Conversation the reply was recorded in.
        conversation_id: Option<ConversationId>,
    },
}

/// Stream of reply events.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ChatEvent, BackendError>> + Send>>;

/// Produces streamed replies for chat requests.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Start a reply for `request`.
    async fn stream(&self, request: ChatRequest) -> Result<ChatStream, BackendError>;
}

/// Backend that echoes the request back word by word.
#[derive(Clone, Debug, Default)]
pub struct EchoChatBackend {
    delay: Duration,
}

impl EchoChatBackend {
    /// Echo backend pausing `delay` between chunks.
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl ChatBackend for EchoChatBackend {
    async fn stream(&self, request: ChatRequest) -> Result<ChatStream, BackendError> {
        type Item = Result<ChatEvent, BackendError>;

        let delay = self.delay;
        let conversation_id = request
            .conversation_id
            .clone()
            .unwrap_or_else(|| ConversationId::from(format!("conv_{}", Uuid::now_v7())));
        let prefix = match request.kind {
            ChatKind::Health => "[health]",
            ChatKind::General => "[general]",
        };
        let words: Vec<String> = std::iter::once(prefix.to_string())
            .chain(request.message.split_whitespace().map(|w| format!(" {w}")))
            .collect();

        Ok(Box::pin(async_stream::stream! {
            for word in words {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let v: Item = Ok(ChatEvent::Delta(word));
                yield v;
            }
            let v: Item = Ok(ChatEvent::Done { conversation_id: Some(conversation_id) });
            yield v;
        }))
    }
}
