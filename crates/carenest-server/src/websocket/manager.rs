//! Session manager: handshake, per-connection receive loops, message
//! dispatch, and user/family fan-out.
//!
//! ## Lifecycle
//!
//! 1. [`SessionManager::accept`] verifies the token, the requested user, the
//!    optional family, and capacity. Rejections close the socket with a
//!    distinct close code and never touch the pool.
//! 2. The connection is registered (superseding any previous one for the
//!    same user) and greeted with `welcome`. Registration re-checks capacity
//!    under the pool lock and backs out if shutdown began meanwhile.
//! 3. A receive loop decodes and dispatches client messages until the socket
//!    closes, the connection is superseded or reaped, or the manager shuts
//!    down. Cleanup runs on every exit path.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message};
use carenest_core::{
    AuthError, ConnectionError, FamilyId, MemberId, ProtocolError, SessionError, UserId,
    close_code,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{Instrument, debug, info, info_span, instrument, warn};

use super::connection::{Connection, ConnectionReader};
use super::heartbeat::HeartbeatMonitor;
use super::pool::ConnectionPool;
use super::protocol::{self, MessageType, WireMessage, status};
use crate::collaborators::{ChatBackend, ChatEvent, ChatKind, ChatRequest, Collaborators};
use crate::config::ServerConfig;
use crate::health::{self, HealthResponse, StatsResponse};
use crate::metrics::{
    WS_AUTH_FAILURES_TOTAL, WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE,
    WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL, WS_MESSAGES_RECEIVED_TOTAL,
    WS_PROTOCOL_ERRORS_TOTAL, WS_SEND_FAILURES_TOTAL, WS_SUPERSESSIONS_TOTAL,
};
use crate::shutdown::ShutdownCoordinator;

/// How long to wait when flushing a rejection or final close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Parameters of an incoming connection request.
#[derive(Clone, Debug)]
pub struct ConnectRequest {
    /// User named in the request path.
    pub user_id: UserId,
    /// Access token from the query string.
    pub token: Option<String>,
    /// Family context requested in the query string.
    pub family_id: Option<FamilyId>,
}

/// Outcome of a family broadcast.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    /// Connections a send was attempted on.
    pub attempted: usize,
    /// Sends that were queued.
    pub delivered: usize,
    /// Sends that failed.
    pub failed: usize,
}

/// Owns the pool, the heartbeat monitor, and every session's receive loop.
pub struct SessionManager {
    config: ServerConfig,
    pool: Arc<ConnectionPool>,
    heartbeat: Arc<HeartbeatMonitor>,
    collaborators: Collaborators,
    shutdown: ShutdownCoordinator,
    monitor: Mutex<Option<JoinHandle<()>>>,
    sessions: Mutex<Vec<JoinHandle<()>>>,
    started_at: Instant,
}

impl SessionManager {
    /// Create a manager. Call [`start`](Self::start) to begin monitoring.
    pub fn new(config: ServerConfig, collaborators: Collaborators) -> Self {
        let pool = Arc::new(ConnectionPool::new());
        let heartbeat = Arc::new(HeartbeatMonitor::new(
            pool.clone(),
            config.heartbeat_interval(),
            config.heartbeat_timeout(),
        ));
        Self {
            config,
            pool,
            heartbeat,
            collaborators,
            shutdown: ShutdownCoordinator::new(),
            monitor: Mutex::new(None),
            sessions: Mutex::new(Vec::new()),
            started_at: Instant::now(),
        }
    }

    /// Start the heartbeat monitor. Calling it again has no effect.
    pub fn start(&self) {
        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            return;
        }
        let task = self.heartbeat.clone().run(self.shutdown.token());
        *monitor = Some(tokio::spawn(task.instrument(info_span!("heartbeat"))));
    }

    /// Stop monitoring, close every connection, and wait for receive loops.
    ///
    /// Bounded by the configured shutdown timeout.
    pub async fn shutdown(&self) {
        // Cancel before draining so an accept that registers after the drain
        // observes the shutdown and backs out.
        self.shutdown.shutdown();
        let connections = self.pool.drain();
        info!(connections = connections.len(), "session manager shutting down");
        for conn in &connections {
            let _ = conn.close(close_code::GOING_AWAY, "Server shutting down");
        }
        gauge!(WS_CONNECTIONS_ACTIVE).set(0.0);

        let mut handles: Vec<JoinHandle<()>> = self.sessions.lock().drain(..).collect();
        handles.extend(self.monitor.lock().take());
        self.shutdown
            .graceful_shutdown(handles, Some(self.config.shutdown_timeout()))
            .await;
        for late in self.sessions.lock().drain(..) {
            late.abort();
        }
        info!("session manager stopped");
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_shutting_down()
    }

    /// Authenticate and register a socket, then spawn its receive loop.
    ///
    /// On rejection the socket is closed with the error's close code and the
    /// error is returned; nothing is registered.
    #[instrument(skip_all, fields(user_id = %request.user_id))]
    pub async fn accept<S, E>(
        self: &Arc<Self>,
        mut socket: S,
        request: ConnectRequest,
    ) -> Result<Arc<Connection>, SessionError>
    where
        S: Stream<Item = Result<Message, E>> + Sink<Message> + Unpin + Send + 'static,
        <S as Sink<Message>>::Error: fmt::Display + Send,
        E: fmt::Display + Send + 'static,
    {
        if self.is_shutting_down() {
            reject(&mut socket, close_code::GOING_AWAY, "Server shutting down").await;
            return Err(ConnectionError::Closed.into());
        }
        if let Err(err) = self.admit(&request).await {
            let reason = rejection_reason(&err);
            counter!(WS_AUTH_FAILURES_TOTAL, "reason" => reason).increment(1);
            warn!(error = %err, code = err.close_code(), "handshake rejected");
            reject(&mut socket, err.close_code(), reason).await;
            return Err(err);
        }

        let (sink, stream) = socket.split();
        let (conn, writer) = Connection::open(
            request.user_id,
            request.family_id,
            sink,
            self.config.send_queue_capacity,
        );
        match self.pool.try_add(conn.clone(), self.config.max_connections) {
            Ok(Some(_)) => counter!(WS_SUPERSESSIONS_TOTAL).increment(1),
            Ok(None) => {}
            Err(err) => {
                let reason = rejection_reason(&err);
                counter!(WS_AUTH_FAILURES_TOTAL, "reason" => reason).increment(1);
                warn!(error = %err, code = err.close_code(), "handshake rejected");
                let _ = conn.close(err.close_code(), reason);
                let _ = time::timeout(CLOSE_GRACE, writer).await;
                return Err(err);
            }
        }
        if self.is_shutting_down() {
            let _ = conn.close(close_code::GOING_AWAY, "Server shutting down");
            let _ = self.pool.remove(conn.id());
            let _ = time::timeout(CLOSE_GRACE, writer).await;
            return Err(ConnectionError::Closed.into());
        }
        counter!(WS_CONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).set(self.pool.count() as f64);
        info!(
            connection_id = %conn.id(),
            family_id = ?conn.family_id(),
            "client connected"
        );

        let welcome = WireMessage::welcome(
            conn.id(),
            conn.user_id(),
            conn.family_id(),
            self.config.heartbeat_interval_secs,
        );
        if let Err(e) = conn.send(&welcome).await {
            self.cleanup(&conn);
            return Err(e.into());
        }

        let reader = ConnectionReader::new(stream, conn.clone(), self.config.max_message_size);
        let span = info_span!(
            "ws_session",
            connection_id = %conn.id(),
            user_id = %conn.user_id()
        );
        let task = self
            .clone()
            .run_session(conn.clone(), reader, writer)
            .instrument(span);
        self.track(tokio::spawn(task));
        Ok(conn)
    }

    async fn admit(&self, request: &ConnectRequest) -> Result<(), SessionError> {
        let token = request
            .token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingToken)?;
        let verified = self.collaborators.auth.verify(token).await?;
        if verified != request.user_id {
            return Err(AuthError::UserMismatch {
                claimed: request.user_id.to_string(),
                actual: verified.to_string(),
            }
            .into());
        }

        if let Some(family_id) = &request.family_id {
            let members = self
                .collaborators
                .family
                .get_family_members(family_id)
                .await
                .map_err(|e| AuthError::MembershipUnverified(e.to_string()))?;
            if !members.contains(&request.user_id) {
                return Err(AuthError::NotFamilyMember {
                    user_id: request.user_id.to_string(),
                    family_id: family_id.to_string(),
                }
                .into());
            }
        }

        // Early refusal; `ConnectionPool::try_add` makes the binding check.
        // A reconnect replaces an existing entry, so it never adds to the count.
        if !self.pool.contains_user(&request.user_id)
            && self.pool.count() >= self.config.max_connections
        {
            return Err(SessionError::CapacityExceeded {
                limit: self.config.max_connections,
            });
        }
        Ok(())
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut sessions = self.sessions.lock();
        sessions.retain(|h| !h.is_finished());
        sessions.push(handle);
    }

    async fn run_session<St, E>(
        self: Arc<Self>,
        conn: Arc<Connection>,
        mut reader: ConnectionReader<St>,
        writer: JoinHandle<()>,
    ) where
        St: Stream<Item = Result<Message, E>> + Unpin + Send,
        E: fmt::Display + Send,
    {
        let guard = SessionGuard {
            manager: &self,
            connection: &conn,
        };
        let mut chat: Option<JoinHandle<()>> = None;

        loop {
            let err = match reader.receive().await {
                Ok(message) => {
                    counter!(WS_MESSAGES_RECEIVED_TOTAL, "type" => message.kind.as_str())
                        .increment(1);
                    match self.dispatch(&conn, message, &mut chat).await {
                        Ok(()) => continue,
                        Err(err) => err,
                    }
                }
                Err(err) => err,
            };
            if err.is_fatal() {
                debug!(reason = %err, "receive loop ended");
                break;
            }
            counter!(WS_PROTOCOL_ERRORS_TOTAL, "code" => err.code()).increment(1);
            warn!(error = %err, code = err.code(), "request failed");
            if conn
                .send(&WireMessage::error(err.code(), &err))
                .await
                .is_err()
            {
                break;
            }
        }

        if let Some(task) = chat.take() {
            task.abort();
        }
        drop(guard);
        let _ = time::timeout(CLOSE_GRACE, writer).await;
    }

    async fn dispatch(
        &self,
        conn: &Arc<Connection>,
        message: WireMessage,
        chat: &mut Option<JoinHandle<()>>,
    ) -> Result<(), SessionError> {
        match message.kind {
            MessageType::Heartbeat => {
                // A client answering a server ping needs no reply.
                if message.status.as_deref() != Some(status::ACK) {
                    conn.send(&WireMessage::heartbeat_ack()).await?;
                }
            }
            MessageType::HealthChat => self.start_chat(conn, &message, ChatKind::Health, chat)?,
            MessageType::GeneralChat => self.start_chat(conn, &message, ChatKind::General, chat)?,
            MessageType::SwitchMember => self.switch_member(conn, &message).await?,
            MessageType::GetStatus => conn.send(&self.status_of(conn)).await?,
            MessageType::Welcome
            | MessageType::ChatStream
            | MessageType::StatusUpdate
            | MessageType::FamilyUpdate
            | MessageType::Notification => {
                return Err(ProtocolError::UnsupportedDirection(message.kind.to_string()).into());
            }
        }
        Ok(())
    }

    fn start_chat(
        &self,
        conn: &Arc<Connection>,
        message: &WireMessage,
        kind: ChatKind,
        chat: &mut Option<JoinHandle<()>>,
    ) -> Result<(), SessionError> {
        if chat.as_ref().is_some_and(|task| !task.is_finished()) {
            return Err(ProtocolError::Busy.into());
        }
        let text = message.data_str("message").ok_or_else(|| {
            ProtocolError::InvalidPayload("data.message must be a non-empty string".into())
        })?;

        let session = conn.session();
        let request = ChatRequest {
            user_id: conn.user_id().clone(),
            family_id: conn.family_id().cloned(),
            active_member_id: message
                .active_member_id
                .clone()
                .or(session.active_member_id),
            conversation_id: message.conversation_id.clone().or(session.conversation_id),
            kind,
            message: text.to_string(),
        };
        debug!(?kind, conversation_id = ?request.conversation_id, "starting chat reply");

        let task = relay_chat(self.collaborators.chat.clone(), conn.clone(), request);
        *chat = Some(tokio::spawn(task.in_current_span()));
        Ok(())
    }

    async fn switch_member(
        &self,
        conn: &Connection,
        message: &WireMessage,
    ) -> Result<(), SessionError> {
        let member_id = message
            .data_str("member_id")
            .map(MemberId::from)
            .or_else(|| message.active_member_id.clone())
            .ok_or_else(|| {
                ProtocolError::InvalidPayload("data.member_id must be a non-empty string".into())
            })?;

        self.collaborators
            .family
            .switch_active_member(conn.user_id(), &member_id)
            .await?;
        conn.set_active_member(Some(member_id.clone()));
        info!(member_id = %member_id, "active member switched");

        let reply = WireMessage::status_update(status::MEMBER_SWITCHED)
            .with_active_member(Some(member_id.clone()));
        conn.send(&reply).await?;

        if let Some(family_id) = conn.family_id() {
            let update = WireMessage::family_update(json!({
                "event": status::MEMBER_SWITCHED,
                "user_id": conn.user_id(),
                "active_member_id": member_id,
            }))
            .with_active_member(Some(member_id));
            let _ = self.broadcast_to_family(family_id, &update, Some(conn.user_id()));
        }
        Ok(())
    }

    fn status_of(&self, conn: &Connection) -> WireMessage {
        let session = conn.session();
        WireMessage::status_update(status::OK)
            .with_data(json!({
                "connection_id": conn.id(),
                "user_id": conn.user_id(),
                "family_id": conn.family_id(),
                "connected_at": conn.connected_at(),
                "last_activity": conn.last_activity(),
                "heartbeat_interval_secs": self.config.heartbeat_interval_secs,
            }))
            .with_conversation(session.conversation_id)
            .with_active_member(session.active_member_id)
    }

    /// Unregister and close a connection. Runs once per session.
    fn cleanup(&self, conn: &Connection) {
        let _ = conn.close(close_code::NORMAL, "Connection closed");
        let _ = self.pool.remove(conn.id());
        counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).set(self.pool.count() as f64);
        let duration = conn.age();
        histogram!(WS_CONNECTION_DURATION_SECONDS).record(duration.as_secs_f64());
        info!(
            connection_id = %conn.id(),
            user_id = %conn.user_id(),
            duration_secs = duration.as_secs(),
            dropped = conn.drop_count(),
            "client disconnected"
        );
    }

    /// Send a message to a user's connection, waiting for queue room.
    ///
    /// Returns `false` (without error) if the user is not connected or the
    /// connection is gone.
    pub async fn send_to_user(&self, user_id: &UserId, message: &WireMessage) -> bool {
        let Some(conn) = self.pool.get_by_user(user_id) else {
            debug!(%user_id, kind = %message.kind, "user not connected, message dropped");
            return false;
        };
        match conn.send(message).await {
            Ok(()) => true,
            Err(e) => {
                counter!(WS_SEND_FAILURES_TOTAL).increment(1);
                debug!(%user_id, error = %e, "send to user failed");
                false
            }
        }
    }

    /// Send a message to every connection in a family, except `exclude`.
    ///
    /// Each send is independent and non-blocking; a failed or full
    /// connection does not affect the rest.
    pub fn broadcast_to_family(
        &self,
        family_id: &FamilyId,
        message: &WireMessage,
        exclude: Option<&UserId>,
    ) -> BroadcastReport {
        let frame: Arc<str> = protocol::encode(message).into();
        let mut report = BroadcastReport::default();

        for conn in self.pool.get_by_family(family_id) {
            if exclude.is_some_and(|u| u == conn.user_id()) {
                continue;
            }
            report.attempted += 1;
            match conn.try_send_frame(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    counter!(WS_SEND_FAILURES_TOTAL).increment(1);
                    warn!(
                        %family_id,
                        connection_id = %conn.id(),
                        user_id = %conn.user_id(),
                        error = %e,
                        "family broadcast delivery failed"
                    );
                }
            }
        }
        debug!(
            %family_id,
            kind = %message.kind,
            attempted = report.attempted,
            delivered = report.delivered,
            "family broadcast"
        );
        report
    }

    /// Send a `notification` to a user.
    pub async fn send_notification(&self, user_id: &UserId, data: Value) -> bool {
        self.send_to_user(user_id, &WireMessage::notification(data))
            .await
    }

    /// Close a user's connection from the server side.
    pub fn disconnect(&self, user_id: &UserId) -> bool {
        let Some(conn) = self.pool.get_by_user(user_id) else {
            return false;
        };
        let closed = conn.close(close_code::NORMAL, "Disconnected by server");
        let _ = self.pool.remove(conn.id());
        closed
    }

    /// The connection registry.
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// The heartbeat monitor.
    pub fn heartbeat(&self) -> &Arc<HeartbeatMonitor> {
        &self.heartbeat
    }

    /// Active configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// `/ws/health` body.
    pub fn health(&self) -> HealthResponse {
        health::health_check(self.pool.count(), self.started_at.elapsed().as_secs())
    }

    /// `/ws/stats` body.
    pub fn stats(&self) -> StatsResponse {
        let snapshots = self.pool.snapshot().iter().map(|c| c.snapshot()).collect();
        health::stats(snapshots, self.heartbeat.stats())
    }
}

/// Runs session cleanup when the receive loop exits, including by panic.
struct SessionGuard<'a> {
    manager: &'a SessionManager,
    connection: &'a Connection,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.manager.cleanup(self.connection);
    }
}

fn rejection_reason(err: &SessionError) -> &'static str {
    match err {
        SessionError::Auth(e) => e.close_reason(),
        SessionError::CapacityExceeded { .. } => "Server at capacity",
        _ => "Connection rejected",
    }
}

async fn reject<S>(socket: &mut S, code: u16, reason: &'static str)
where
    S: Sink<Message> + Unpin,
{
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = time::timeout(CLOSE_GRACE, socket.send(Message::Close(Some(frame)))).await;
    let _ = time::timeout(CLOSE_GRACE, socket.close()).await;
}

async fn relay_chat(backend: Arc<dyn ChatBackend>, conn: Arc<Connection>, request: ChatRequest) {
    if let Err(e) = stream_reply(backend.as_ref(), &conn, request).await {
        debug!(error = %e, "chat relay stopped");
    }
}

/// Relay one reply: `processing`, the deltas in order, then `done` or `error`.
async fn stream_reply(
    backend: &dyn ChatBackend,
    conn: &Connection,
    request: ChatRequest,
) -> Result<(), ConnectionError> {
    let mut conversation_id = request.conversation_id.clone();
    conn.send(
        &WireMessage::status_update(status::PROCESSING).with_conversation(conversation_id.clone()),
    )
    .await?;

    let mut stream = match backend.stream(request).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "chat backend failed to start");
            return conn
                .send(&WireMessage::error(e.code(), &e).with_conversation(conversation_id))
                .await;
        }
    };

    loop {
        let event = tokio::select! {
            biased;
            () = conn.closed() => return Err(ConnectionError::Closed),
            event = stream.next() => event,
        };
        match event {
            Some(Ok(ChatEvent::Delta(text))) => {
                conn.send(&WireMessage::chat_delta(text, conversation_id.clone()))
                    .await?;
            }
            Some(Ok(ChatEvent::Done {
                conversation_id: final_id,
            })) => {
                if final_id.is_some() {
                    conversation_id = final_id;
                }
                break;
            }
            None => break,
            Some(Err(e)) => {
                warn!(error = %e, "chat stream failed");
                return conn
                    .send(&WireMessage::error(e.code(), &e).with_conversation(conversation_id))
                    .await;
            }
        }
    }

    conn.set_conversation(conversation_id.clone());
    conn.send(&WireMessage::status_update(status::DONE).with_conversation(conversation_id))
        .await
}
