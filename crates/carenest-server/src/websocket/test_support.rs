//! In-memory socket and collaborator fakes for session tests.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message};
use carenest_core::{AuthError, BackendError, UserId};
use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded};
use futures::{Sink, Stream, StreamExt};
use tokio::sync::Notify;

use super::protocol::{self, WireMessage};
use crate::collaborators::{
    AuthValidator, ChatBackend, ChatEvent, ChatRequest, ChatStream, Collaborators,
    EchoChatBackend, FamilyRecord, InMemoryFamilyService,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Server half of an in-memory WebSocket.
pub(crate) struct TestSocket {
    incoming: UnboundedReceiver<Result<Message, axum::Error>>,
    outgoing: UnboundedSender<Message>,
}

/// Client half of an in-memory WebSocket.
pub(crate) struct TestPeer {
    to_server: Option<UnboundedSender<Result<Message, axum::Error>>>,
    from_server: UnboundedReceiver<Message>,
}

pub(crate) fn socket_pair() -> (TestSocket, TestPeer) {
    let (to_server, incoming) = unbounded();
    let (outgoing, from_server) = unbounded();
    (
        TestSocket { incoming, outgoing },
        TestPeer {
            to_server: Some(to_server),
            from_server,
        },
    )
}

impl Stream for TestSocket {
    type Item = Result<Message, axum::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.incoming.poll_next_unpin(cx)
    }
}

impl Sink<Message> for TestSocket {
    type Error = axum::Error;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.outgoing)
            .poll_ready(cx)
            .map_err(axum::Error::new)
    }

    fn start_send(mut self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
        Pin::new(&mut self.outgoing)
            .start_send(item)
            .map_err(axum::Error::new)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.outgoing)
            .poll_flush(cx)
            .map_err(axum::Error::new)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.outgoing)
            .poll_close(cx)
            .map_err(axum::Error::new)
    }
}

impl TestPeer {
    /// Send a raw text frame to the server.
    pub(crate) fn send_text(&self, text: &str) {
        self.to_server
            .as_ref()
            .expect("peer already hung up")
            .unbounded_send(Ok(Message::Text(text.into())))
            .expect("server half dropped");
    }

    /// Send a message to the server.
    pub(crate) fn send(&self, message: &WireMessage) {
        self.send_text(&protocol::encode(message));
    }

    /// Drop the client's outbound half, as if the client went away.
    pub(crate) fn hang_up(&mut self) {
        self.to_server = None;
    }

    /// Next decoded text frame from the server.
    pub(crate) async fn next_message(&mut self) -> WireMessage {
        loop {
            let frame = tokio::time::timeout(RECV_TIMEOUT, self.from_server.next())
                .await
                .expect("timed out waiting for a server frame")
                .expect("server closed the socket");
            match frame {
                Message::Text(text) => return protocol::decode(&text).unwrap(),
                Message::Close(frame) => panic!("unexpected close: {frame:?}"),
                _ => {}
            }
        }
    }

    /// Next close frame from the server, skipping text frames.
    pub(crate) async fn next_close(&mut self) -> Option<CloseFrame> {
        loop {
            let frame = tokio::time::timeout(RECV_TIMEOUT, self.from_server.next())
                .await
                .expect("timed out waiting for a close frame");
            match frame {
                Some(Message::Close(frame)) => return frame,
                Some(_) => {}
                None => return None,
            }
        }
    }

    /// Whether a frame arrives within `wait`.
    pub(crate) async fn receives_within(&mut self, wait: Duration) -> bool {
        matches!(
            tokio::time::timeout(wait, self.from_server.next()).await,
            Ok(Some(_))
        )
    }
}

/// Accepts `token:<user>`; `expired` is expired; anything else is invalid.
pub(crate) struct StaticAuth;

#[async_trait]
impl AuthValidator for StaticAuth {
    async fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        if token == "expired" {
            return Err(AuthError::Expired);
        }
        token
            .strip_prefix("token:")
            .filter(|u| !u.is_empty())
            .map(UserId::from)
            .ok_or_else(|| AuthError::InvalidToken("unrecognized test token".into()))
    }
}

/// [`StaticAuth`] that parks every verification until released.
#[derive(Default)]
pub(crate) struct GatedAuth {
    /// Signalled when a verification reaches the gate.
    pub(crate) entered: Notify,
    /// Lets one parked verification continue.
    pub(crate) release: Notify,
}

#[async_trait]
impl AuthValidator for GatedAuth {
    async fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        self.entered.notify_one();
        self.release.notified().await;
        StaticAuth.verify(token).await
    }
}

/// Chat backend whose replies never finish.
pub(crate) struct StalledChat;

#[async_trait]
impl ChatBackend for StalledChat {
    async fn stream(&self, _request: ChatRequest) -> Result<ChatStream, BackendError> {
        Ok(Box::pin(futures::stream::pending::<
            Result<ChatEvent, BackendError>,
        >()))
    }
}

/// Chat backend that refuses every request.
pub(crate) struct FailingChat;

#[async_trait]
impl ChatBackend for FailingChat {
    async fn stream(&self, _request: ChatRequest) -> Result<ChatStream, BackendError> {
        Err(BackendError::Chat("model unavailable".into()))
    }
}

/// Families `f1` = {u1, u2} with members {m1, m2}, and `f2` = {u3}.
pub(crate) fn families() -> Arc<InMemoryFamilyService> {
    let svc = InMemoryFamilyService::new();
    svc.insert_family(
        "f1".into(),
        FamilyRecord {
            users: vec!["u1".into(), "u2".into()],
            members: vec!["m1".into(), "m2".into()],
        },
    );
    svc.insert_family(
        "f2".into(),
        FamilyRecord {
            users: vec!["u3".into()],
            members: vec![],
        },
    );
    Arc::new(svc)
}

pub(crate) fn collaborators() -> Collaborators {
    collaborators_with_chat(Arc::new(EchoChatBackend::default()))
}

pub(crate) fn collaborators_with_chat(chat: Arc<dyn ChatBackend>) -> Collaborators {
    Collaborators {
        auth: Arc::new(StaticAuth),
        chat,
        family: families(),
    }
}

/// Poll `condition` until it holds or a second passes.
pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
