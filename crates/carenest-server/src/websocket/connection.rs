//! Authenticated WebSocket connection state.
//!
//! A [`Connection`] owns the outbound half of one socket through a bounded
//! queue drained by a dedicated writer task, so at most one frame is ever in
//! flight on the transport. The inbound half is read by a
//! [`ConnectionReader`] owned by the session's receive loop.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message};
use carenest_core::{
    ConnectionError, ConnectionId, ConversationId, FamilyId, MemberId, ProtocolError,
    SessionError, UserId,
};
use chrono::{DateTime, Utc};
use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{Instrument, debug, info_span};

use super::protocol::{self, WireMessage};
use crate::health::SessionSnapshot;

/// How long the writer waits to flush the close frame before dropping the socket.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Mutable per-session context carried by a connection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionState {
    /// Conversation the client is currently in.
    pub conversation_id: Option<ConversationId>,
    /// Family member profile the client is acting for.
    pub active_member_id: Option<MemberId>,
}

/// Close code and reason recorded when a connection is closed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseReason {
    /// WebSocket close code.
    pub code: u16,
    /// Human-readable reason.
    pub reason: String,
}

/// Shared between a connection and its writer task.
#[derive(Debug, Default)]
struct CloseSignal {
    token: CancellationToken,
    reason: Mutex<Option<CloseReason>>,
}

/// Represents an authenticated client connection.
pub struct Connection {
    id: ConnectionId,
    user_id: UserId,
    family_id: Option<FamilyId>,
    session: Mutex<SessionState>,
    connected_at: DateTime<Utc>,
    opened: Instant,
    last_heartbeat: Mutex<Instant>,
    last_activity: Mutex<DateTime<Utc>>,
    active: AtomicBool,
    closing: Arc<CloseSignal>,
    close_reason: Mutex<Option<CloseReason>>,
    /// Send channel to the writer task.
    tx: mpsc::Sender<Arc<str>>,
    /// Count of frames refused because the queue was full.
    dropped_messages: AtomicU64,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("family_id", &self.family_id)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create a connection around an existing outbound queue.
    pub fn new(
        id: ConnectionId,
        user_id: UserId,
        family_id: Option<FamilyId>,
        tx: mpsc::Sender<Arc<str>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id,
            family_id,
            session: Mutex::new(SessionState::default()),
            connected_at: now,
            opened: Instant::now(),
            last_heartbeat: Mutex::new(Instant::now()),
            last_activity: Mutex::new(now),
            active: AtomicBool::new(true),
            closing: Arc::new(CloseSignal::default()),
            close_reason: Mutex::new(None),
            tx,
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Create a connection writing to `sink` and spawn its writer task.
    pub fn open<Si>(
        user_id: UserId,
        family_id: Option<FamilyId>,
        sink: Si,
        queue_capacity: usize,
    ) -> (Arc<Self>, JoinHandle<()>)
    where
        Si: Sink<Message> + Unpin + Send + 'static,
        Si::Error: fmt::Display + Send,
    {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let conn = Arc::new(Self::new(ConnectionId::generate(), user_id, family_id, tx));
        let span = info_span!("ws_writer", connection_id = %conn.id);
        let writer = tokio::spawn(run_writer(sink, rx, conn.closing.clone()).instrument(span));
        (conn, writer)
    }

    /// Unique connection ID.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Authenticated user.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Family the connection joined, if any.
    pub fn family_id(&self) -> Option<&FamilyId> {
        self.family_id.as_ref()
    }

    /// When the connection was established.
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.opened.elapsed()
    }

    /// Current session context.
    pub fn session(&self) -> SessionState {
        self.session.lock().clone()
    }

    /// Record the conversation the client is in.
    pub fn set_conversation(&self, conversation_id: Option<ConversationId>) {
        self.session.lock().conversation_id = conversation_id;
    }

    /// Record the family member the client is acting for.
    pub fn set_active_member(&self, member_id: Option<MemberId>) {
        self.session.lock().active_member_id = member_id;
    }

    /// Record liveness evidence.
    pub fn touch_heartbeat(&self) {
        *self.last_heartbeat.lock() = Instant::now();
        *self.last_activity.lock() = Utc::now();
    }

    /// Time since the last liveness evidence (or establishment).
    pub fn since_last_heartbeat(&self) -> Duration {
        self.last_heartbeat.lock().elapsed()
    }

    /// Wall-clock time of the last liveness evidence.
    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.lock()
    }

    /// `true` until [`close`](Self::close) runs or the writer gives up.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) && !self.closing.token.is_cancelled()
    }

    /// Resolves once the connection is closing.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closing.token.cancelled()
    }

    /// Close code and reason, once closed by the server.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().clone()
    }

    /// Close the connection with `code` and `reason`.
    ///
    /// Takes effect once; returns `false` if the connection was already
    /// closed. Frames still queued are discarded and the writer sends the
    /// close frame.
    pub fn close(&self, code: u16, reason: &str) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        let reason = CloseReason {
            code,
            reason: reason.to_string(),
        };
        *self.close_reason.lock() = Some(reason.clone());
        *self.closing.reason.lock() = Some(reason);
        self.closing.token.cancel();
        debug!(connection_id = %self.id, code, "connection closed");
        true
    }

    /// Serialize and queue a message, waiting while the queue is full.
    pub async fn send(&self, message: &WireMessage) -> Result<(), ConnectionError> {
        self.send_frame(protocol::encode(message).into()).await
    }

    /// Queue an encoded frame, waiting while the queue is full.
    pub async fn send_frame(&self, frame: Arc<str>) -> Result<(), ConnectionError> {
        if !self.is_active() {
            return Err(ConnectionError::Closed);
        }
        tokio::select! {
            biased;
            () = self.closing.token.cancelled() => Err(ConnectionError::Closed),
            res = self.tx.send(frame) => res.map_err(|_| ConnectionError::Closed),
        }
    }

    /// Serialize and queue a message without waiting.
    pub fn try_send(&self, message: &WireMessage) -> Result<(), ConnectionError> {
        self.try_send_frame(protocol::encode(message).into())
    }

    /// Queue an encoded frame without waiting.
    ///
    /// A full queue increments the dropped message counter and yields
    /// [`ConnectionError::Backpressure`].
    pub fn try_send_frame(&self, frame: Arc<str>) -> Result<(), ConnectionError> {
        if !self.is_active() {
            return Err(ConnectionError::Closed);
        }
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                Err(ConnectionError::Backpressure)
            }
            Err(TrySendError::Closed(_)) => Err(ConnectionError::Closed),
        }
    }

    /// Total frames refused because the queue was full.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Point-in-time view for the stats endpoint.
    pub fn snapshot(&self) -> SessionSnapshot {
        let session = self.session();
        SessionSnapshot {
            connection_id: self.id.clone(),
            user_id: self.user_id.clone(),
            family_id: self.family_id.clone(),
            connected_at: self.connected_at,
            last_activity: self.last_activity(),
            active_member_id: session.active_member_id,
            conversation_id: session.conversation_id,
        }
    }
}

/// Drain the outbound queue into the socket until the connection closes.
async fn run_writer<Si>(mut sink: Si, mut rx: mpsc::Receiver<Arc<str>>, closing: Arc<CloseSignal>)
where
    Si: Sink<Message> + Unpin,
    Si::Error: fmt::Display,
{
    loop {
        let frame = tokio::select! {
            biased;
            () = closing.token.cancelled() => break,
            frame = rx.recv() => frame,
        };
        let Some(frame) = frame else { break };
        let sent = tokio::select! {
            biased;
            () = closing.token.cancelled() => break,
            res = sink.send(Message::Text(frame.as_ref().into())) => res,
        };
        if let Err(e) = sent {
            debug!(error = %e, "websocket write failed");
            closing.token.cancel();
            break;
        }
    }

    let reason = closing.reason.lock().take();
    if let Some(reason) = reason {
        let frame = CloseFrame {
            code: reason.code,
            reason: reason.reason.into(),
        };
        let _ = time::timeout(CLOSE_GRACE, sink.send(Message::Close(Some(frame)))).await;
    }
    let _ = time::timeout(CLOSE_GRACE, sink.close()).await;
}

/// Inbound half of a connection.
pub struct ConnectionReader<St> {
    stream: St,
    connection: Arc<Connection>,
    max_message_size: usize,
}

impl<St, E> ConnectionReader<St>
where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    /// Wrap the inbound half of a socket.
    pub fn new(stream: St, connection: Arc<Connection>, max_message_size: usize) -> Self {
        Self {
            stream,
            connection,
            max_message_size,
        }
    }

    /// Wait for the next decoded client message.
    ///
    /// Transport pings and pongs count as liveness and are not surfaced.
    /// Protocol errors leave the connection usable; every other error means
    /// the connection is gone.
    pub async fn receive(&mut self) -> Result<WireMessage, SessionError> {
        loop {
            let next = tokio::select! {
                biased;
                () = self.connection.closed() => return Err(ConnectionError::Closed.into()),
                next = self.stream.next() => next,
            };
            let message = match next {
                None => return Err(ConnectionError::Closed.into()),
                Some(Err(e)) => {
                    debug!(error = %e, "websocket read failed");
                    return Err(ConnectionError::Closed.into());
                }
                Some(Ok(Message::Text(text))) => {
                    self.check_size(text.len())?;
                    protocol::decode(text.as_str())?
                }
                Some(Ok(Message::Binary(bytes))) => {
                    self.check_size(bytes.len())?;
                    protocol::decode_bytes(&bytes)?
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    self.connection.touch_heartbeat();
                    continue;
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(code = ?frame.as_ref().map(|f| f.code), "client closed websocket");
                    return Err(ConnectionError::Closed.into());
                }
            };
            self.connection.touch_heartbeat();
            return Ok(message);
        }
    }

    fn check_size(&self, size: usize) -> Result<(), ProtocolError> {
        if size > self.max_message_size {
            return Err(ProtocolError::TooLarge {
                size,
                limit: self.max_message_size,
            });
        }
        Ok(())
    }
}
