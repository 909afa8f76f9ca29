//! End-to-end tests over real sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use carenest_core::{UserId, close_code};
use carenest_server::collaborators::{
    Collaborators, EchoChatBackend, InMemoryFamilyService, JwtAuthValidator, issue_token,
};
use carenest_server::config::ServerConfig;
use carenest_server::server::CarenestServer;
use carenest_server::websocket::protocol::{self, MessageType, WireMessage, status};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

const SECRET: &[u8] = b"test-secret";
const FAMILIES: &str = r#"{
    "families": {
        "f1": { "users": ["u1", "u2"], "members": ["m1", "m2"] },
        "f2": { "users": ["u3"] }
    }
}"#;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    server: CarenestServer,
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

async fn start_server() -> TestServer {
    let collaborators = Collaborators {
        auth: Arc::new(JwtAuthValidator::new(SECRET, 0, None)),
        chat: Arc::new(EchoChatBackend::default()),
        family: Arc::new(InMemoryFamilyService::from_json(FAMILIES).unwrap()),
    };
    let config = ServerConfig {
        shutdown_timeout_secs: 2,
        ..ServerConfig::default()
    };
    let server = CarenestServer::new(config, collaborators);
    let (addr, handle) = server.listen().await.unwrap();
    TestServer {
        server,
        addr,
        handle,
    }
}

fn token_for(user: &str) -> String {
    issue_token(SECRET, &UserId::from(user), Duration::from_secs(300), None).unwrap()
}

async fn connect_with(addr: SocketAddr, user: &str, token: &str, family: Option<&str>) -> Client {
    let mut url = format!("ws://{addr}/ws/chat/{user}?token={token}");
    if let Some(family) = family {
        url.push_str(&format!("&family_id={family}"));
    }
    let (client, _) = connect_async(url).await.unwrap();
    client
}

/// Connect with a valid token and consume the welcome.
async fn connect(addr: SocketAddr, user: &str, family: Option<&str>) -> Client {
    let mut client = connect_with(addr, user, &token_for(user), family).await;
    let welcome = recv(&mut client).await;
    assert_eq!(welcome.kind, MessageType::Welcome);
    client
}

async fn recv(client: &mut Client) -> WireMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for a message")
            .expect("socket ended")
            .expect("socket error");
        match frame {
            Message::Text(text) => return protocol::decode(&text).unwrap(),
            Message::Close(frame) => panic!("unexpected close: {frame:?}"),
            _ => {}
        }
    }
}

async fn recv_close(client: &mut Client) -> Option<u16> {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for close");
        match frame {
            Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
            Some(Ok(_)) => {}
            Some(Err(_)) | None => return None,
        }
    }
}

async fn send(client: &mut Client, value: serde_json::Value) {
    client.send(Message::text(value.to_string())).await.unwrap();
}

#[tokio::test]
async fn welcome_identifies_the_connection() {
    let ts = start_server().await;
    let mut client = connect_with(ts.addr, "u1", &token_for("u1"), Some("f1")).await;

    let welcome = recv(&mut client).await;
    assert_eq!(welcome.kind, MessageType::Welcome);
    assert_eq!(welcome.data_str("user_id"), Some("u1"));
    assert_eq!(welcome.data_str("family_id"), Some("f1"));
    assert!(welcome.data_str("connection_id").is_some());
    assert_eq!(ts.server.manager().pool().count(), 1);
}

#[tokio::test]
async fn invalid_token_is_closed_with_4002() {
    let ts = start_server().await;
    let mut client = connect_with(ts.addr, "u1", "not-a-jwt", None).await;
    assert_eq!(recv_close(&mut client).await, Some(close_code::TOKEN_INVALID));
    assert_eq!(ts.server.manager().pool().count(), 0);
}

#[tokio::test]
async fn token_for_another_user_is_closed_with_4003() {
    let ts = start_server().await;
    let mut client = connect_with(ts.addr, "u1", &token_for("u2"), None).await;
    assert_eq!(recv_close(&mut client).await, Some(close_code::FORBIDDEN));
}

#[tokio::test]
async fn foreign_family_is_closed_with_4003() {
    let ts = start_server().await;
    let mut client = connect_with(ts.addr, "u3", &token_for("u3"), Some("f1")).await;
    assert_eq!(recv_close(&mut client).await, Some(close_code::FORBIDDEN));
}

#[tokio::test]
async fn reconnect_supersedes_the_old_socket() {
    let ts = start_server().await;
    let mut first = connect(ts.addr, "u1", None).await;
    let mut second = connect(ts.addr, "u1", None).await;

    assert_eq!(recv_close(&mut first).await, Some(close_code::SUPERSEDED));

    let health: serde_json::Value = reqwest::get(format!("http://{}/ws/health", ts.addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["active_connections"], 1);

    send(&mut second, json!({"type": "heartbeat"})).await;
    assert_eq!(recv(&mut second).await.status.as_deref(), Some(status::ACK));
}

#[tokio::test]
async fn chat_reply_streams_then_completes() {
    let ts = start_server().await;
    let mut client = connect(ts.addr, "u1", None).await;
    send(
        &mut client,
        json!({"type": "health_chat", "data": {"message": "slept badly"}}),
    )
    .await;

    let processing = recv(&mut client).await;
    assert_eq!(processing.status.as_deref(), Some(status::PROCESSING));

    let mut reply = String::new();
    let done = loop {
        let msg = recv(&mut client).await;
        if msg.kind == MessageType::ChatStream {
            reply.push_str(msg.delta.as_deref().unwrap_or_default());
        } else {
            break msg;
        }
    };
    assert_eq!(reply, "[health] slept badly");
    assert_eq!(done.status.as_deref(), Some(status::DONE));
    assert!(done.conversation_id.is_some());
}

#[tokio::test]
async fn malformed_input_keeps_the_session_open() {
    let ts = start_server().await;
    let mut client = connect(ts.addr, "u1", None).await;

    client.send(Message::text("not json")).await.unwrap();
    let err = recv(&mut client).await;
    assert_eq!(err.status.as_deref(), Some(status::ERROR));
    assert_eq!(err.data_str("code"), Some("MALFORMED_MESSAGE"));

    send(&mut client, json!({"type": "get_status"})).await;
    let reply = recv(&mut client).await;
    assert_eq!(reply.status.as_deref(), Some(status::OK));
    assert_eq!(reply.data_str("user_id"), Some("u1"));
}

#[tokio::test]
async fn family_broadcast_stays_within_the_family() {
    let ts = start_server().await;
    let mut u1 = connect(ts.addr, "u1", Some("f1")).await;
    let mut u2 = connect(ts.addr, "u2", Some("f1")).await;
    let mut u3 = connect(ts.addr, "u3", Some("f2")).await;

    let report = ts.server.manager().broadcast_to_family(
        &"f1".into(),
        &WireMessage::family_update(json!({"event": "care_plan_updated"})),
        None,
    );
    assert_eq!(report.delivered, 2);

    for client in [&mut u1, &mut u2] {
        let update = recv(client).await;
        assert_eq!(update.kind, MessageType::FamilyUpdate);
        assert_eq!(update.data_str("event"), Some("care_plan_updated"));
    }
    let silent = tokio::time::timeout(Duration::from_millis(200), u3.next()).await;
    assert!(silent.is_err());
}

#[tokio::test]
async fn stats_endpoint_lists_sessions() {
    let ts = start_server().await;
    let _u1 = connect(ts.addr, "u1", Some("f1")).await;

    let stats: serde_json::Value = reqwest::get(format!("http://{}/ws/stats", ts.addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["total_connections"], 1);
    assert_eq!(stats["sessions"]["u1"]["family_id"], "f1");
}

#[tokio::test]
async fn shutdown_closes_clients_with_going_away() {
    let ts = start_server().await;
    let mut client = connect(ts.addr, "u1", None).await;

    ts.server.manager().shutdown().await;
    ts.server.shutdown().shutdown();

    assert_eq!(recv_close(&mut client).await, Some(close_code::GOING_AWAY));
    tokio::time::timeout(Duration::from_secs(5), ts.handle)
        .await
        .unwrap()
        .unwrap();
}
