//! Wire envelope shared by every client and server message.
//!
//! Every frame is a UTF-8 JSON object:
//!
//! ```json
//! {
//!   "type": "general_chat",
//!   "data": { "message": "hi" },
//!   "conversation_id": null,
//!   "active_member_id": null,
//!   "status": null,
//!   "delta": null,
//!   "timestamp": "2026-01-01T00:00:00Z"
//! }
//! ```
//!
//! Unknown fields are ignored on decode. Encoding always emits every field
//! so clients can rely on a stable shape.

use std::fmt;

use carenest_core::{ConnectionId, ConversationId, FamilyId, MemberId, ProtocolError, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value, json};

/// Closed set of message tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Server greeting sent once after registration.
    Welcome,
    /// Liveness check, sent by either side.
    Heartbeat,
    /// Health-topic chat request.
    HealthChat,
    /// General chat request.
    GeneralChat,
    /// Change the active family member profile.
    SwitchMember,
    /// Request a session snapshot.
    GetStatus,
    /// Incremental chat reply chunk.
    ChatStream,
    /// Lifecycle or error status.
    StatusUpdate,
    /// Change visible to the whole family.
    FamilyUpdate,
    /// Server-initiated notification.
    Notification,
}

impl MessageType {
    /// Every tag, in declaration order.
    pub const ALL: [Self; 10] = [
        Self::Welcome,
        Self::Heartbeat,
        Self::HealthChat,
        Self::GeneralChat,
        Self::SwitchMember,
        Self::GetStatus,
        Self::ChatStream,
        Self::StatusUpdate,
        Self::FamilyUpdate,
        Self::Notification,
    ];

    /// Wire name of this tag.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Welcome => "welcome",
            Self::Heartbeat => "heartbeat",
            Self::HealthChat => "health_chat",
            Self::GeneralChat => "general_chat",
            Self::SwitchMember => "switch_member",
            Self::GetStatus => "get_status",
            Self::ChatStream => "chat_stream",
            Self::StatusUpdate => "status_update",
            Self::FamilyUpdate => "family_update",
            Self::Notification => "notification",
        }
    }

    /// Look up a tag by wire name.
    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == tag)
    }

    /// Whether clients are allowed to send this tag.
    pub fn is_client_originated(self) -> bool {
        matches!(
            self,
            Self::Heartbeat
                | Self::HealthChat
                | Self::GeneralChat
                | Self::SwitchMember
                | Self::GetStatus
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status values carried by `status_update` messages.
pub mod status {
    /// A chat request was accepted and the reply is being produced.
    pub const PROCESSING: &str = "processing";
    /// A chat reply finished.
    pub const DONE: &str = "done";
    /// The request failed; `data` carries `code` and `message`.
    pub const ERROR: &str = "error";
    /// Reply to a client heartbeat.
    pub const ACK: &str = "ack";
    /// Server-initiated heartbeat ping.
    pub const PING: &str = "ping";
    /// Reply to `get_status`.
    pub const OK: &str = "ok";
    /// The active member changed.
    pub const MEMBER_SWITCHED: &str = "member_switched";
}

/// The JSON envelope for every frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Message tag.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Type-specific payload. `null` and absent both decode as empty.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub data: Map<String, Value>,
    /// Conversation this message belongs to.
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    /// Family member profile the message acts for.
    #[serde(default)]
    pub active_member_id: Option<MemberId>,
    /// Lifecycle status (`processing`, `done`, `error`, ...).
    #[serde(default)]
    pub status: Option<String>,
    /// Streamed text chunk.
    #[serde(default)]
    pub delta: Option<String>,
    /// Creation time. Defaults to now when the client omits it.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

impl WireMessage {
    /// Empty message of the given type, stamped now.
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            data: Map::new(),
            conversation_id: None,
            active_member_id: None,
            status: None,
            delta: None,
            timestamp: Utc::now(),
        }
    }

    /// Replace the payload. Non-object values are wrapped as `{"value": v}`.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = match data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                let _ = map.insert("value".into(), other);
                map
            }
        };
        self
    }

    /// Set the status field.
    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Set the conversation id.
    #[must_use]
    pub fn with_conversation(mut self, conversation_id: Option<ConversationId>) -> Self {
        self.conversation_id = conversation_id;
        self
    }

    /// Set the active member id.
    #[must_use]
    pub fn with_active_member(mut self, member_id: Option<MemberId>) -> Self {
        self.active_member_id = member_id;
        self
    }

    /// Greeting sent once a connection is registered.
    pub fn welcome(
        connection_id: &ConnectionId,
        user_id: &UserId,
        family_id: Option<&FamilyId>,
        heartbeat_interval_secs: u64,
    ) -> Self {
        Self::new(MessageType::Welcome).with_data(json!({
            "connection_id": connection_id,
            "user_id": user_id,
            "family_id": family_id,
            "heartbeat_interval_secs": heartbeat_interval_secs,
        }))
    }

    /// Server-initiated heartbeat ping.
    pub fn heartbeat_ping() -> Self {
        Self::new(MessageType::Heartbeat).with_status(status::PING)
    }

    /// Reply to a client heartbeat.
    pub fn heartbeat_ack() -> Self {
        Self::new(MessageType::Heartbeat).with_status(status::ACK)
    }

    /// `status_update` carrying only a status.
    pub fn status_update(status: &str) -> Self {
        Self::new(MessageType::StatusUpdate).with_status(status)
    }

    /// `status_update` describing a failed request.
    pub fn error(code: &str, message: impl fmt::Display) -> Self {
        Self::status_update(status::ERROR).with_data(json!({
            "code": code,
            "message": message.to_string(),
        }))
    }

    /// One chunk of a streamed chat reply.
    pub fn chat_delta(delta: impl Into<String>, conversation_id: Option<ConversationId>) -> Self {
        let mut msg = Self::new(MessageType::ChatStream).with_conversation(conversation_id);
        msg.delta = Some(delta.into());
        msg
    }

    /// Family-wide update.
    pub fn family_update(data: Value) -> Self {
        Self::new(MessageType::FamilyUpdate).with_data(data)
    }

    /// Server-initiated notification.
    pub fn notification(data: Value) -> Self {
        Self::new(MessageType::Notification).with_data(data)
    }

    /// String field from `data`, if present and non-empty.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

/// Decode a text frame.
pub fn decode(text: &str) -> Result<WireMessage, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let Value::Object(fields) = &value else {
        return Err(ProtocolError::Malformed("expected a JSON object".into()));
    };
    match fields.get("type") {
        None | Some(Value::Null) => return Err(ProtocolError::MissingType),
        Some(Value::String(tag)) => {
            if MessageType::parse(tag).is_none() {
                return Err(ProtocolError::UnknownType(tag.clone()));
            }
        }
        Some(other) => return Err(ProtocolError::UnknownType(other.to_string())),
    }
    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload(e.to_string()))
}

/// Decode a binary frame holding UTF-8 JSON.
pub fn decode_bytes(bytes: &[u8]) -> Result<WireMessage, ProtocolError> {
    let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::NotUtf8)?;
    decode(text)
}

/// Encode a message as a JSON text frame.
pub fn encode(message: &WireMessage) -> String {
    serde_json::to_string(message).unwrap_or_else(|e| {
        tracing::error!(error = %e, kind = %message.kind, "failed to serialize wire message");
        String::new()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn every_tag_parses_back() {
        for kind in MessageType::ALL {
            assert_eq!(MessageType::parse(kind.as_str()), Some(kind));
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, kind.as_str());
        }
        assert_eq!(MessageType::parse("bogus"), None);
    }

    #[test]
    fn client_originated_set() {
        let client: Vec<_> = MessageType::ALL
            .into_iter()
            .filter(|k| k.is_client_originated())
            .collect();
        assert_eq!(
            client,
            vec![
                MessageType::Heartbeat,
                MessageType::HealthChat,
                MessageType::GeneralChat,
                MessageType::SwitchMember,
                MessageType::GetStatus,
            ]
        );
    }

    #[test]
    fn decode_minimal_message() {
        let msg = decode(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(msg.kind, MessageType::Heartbeat);
        assert!(msg.data.is_empty());
        assert!(msg.conversation_id.is_none());
    }

    #[test]
    fn decode_full_message() {
        let msg = decode(
            r#"{"type":"general_chat","data":{"message":"hi"},"conversation_id":"c1",
                "active_member_id":"m1","timestamp":"2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(msg.kind, MessageType::GeneralChat);
        assert_eq!(msg.data_str("message"), Some("hi"));
        assert_eq!(msg.conversation_id.as_deref(), Some("c1"));
        assert_eq!(msg.active_member_id.as_deref(), Some("m1"));
        assert_eq!(msg.timestamp.to_rfc3339(), "2026-01-01T00:00:00+00:00");
    }

    #[test]
    fn null_data_decodes_as_empty() {
        let msg = decode(r#"{"type":"get_status","data":null}"#).unwrap();
        assert!(msg.data.is_empty());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let msg = decode(r#"{"type":"heartbeat","extra":42,"nested":{"a":1}}"#).unwrap();
        assert_eq!(msg.kind, MessageType::Heartbeat);
    }

    #[test]
    fn not_json_is_malformed() {
        assert_matches!(decode("not json"), Err(ProtocolError::Malformed(_)));
    }

    #[test]
    fn non_object_is_malformed() {
        assert_matches!(decode("[1,2]"), Err(ProtocolError::Malformed(_)));
        assert_matches!(decode("\"heartbeat\""), Err(ProtocolError::Malformed(_)));
    }

    #[test]
    fn missing_type_is_reported() {
        assert_matches!(decode(r#"{"data":{}}"#), Err(ProtocolError::MissingType));
        assert_matches!(decode(r#"{"type":null}"#), Err(ProtocolError::MissingType));
    }

    #[test]
    fn unknown_type_names_the_tag() {
        assert_matches!(
            decode(r#"{"type":"launch_rockets"}"#),
            Err(ProtocolError::UnknownType(tag)) if tag == "launch_rockets"
        );
        assert_matches!(decode(r#"{"type":7}"#), Err(ProtocolError::UnknownType(_)));
    }

    #[test]
    fn wrong_field_type_is_invalid_payload() {
        assert_matches!(
            decode(r#"{"type":"heartbeat","data":[1]}"#),
            Err(ProtocolError::InvalidPayload(_))
        );
        assert_matches!(
            decode(r#"{"type":"heartbeat","timestamp":"yesterday"}"#),
            Err(ProtocolError::InvalidPayload(_))
        );
    }

    #[test]
    fn binary_frames_must_be_utf8() {
        assert!(decode_bytes(br#"{"type":"heartbeat"}"#).is_ok());
        assert_matches!(decode_bytes(&[0xff, 0xfe]), Err(ProtocolError::NotUtf8));
    }

    #[test]
    fn encode_emits_every_field() {
        let json: Value = serde_json::from_str(&encode(&WireMessage::heartbeat_ack())).unwrap();
        let obj = json.as_object().unwrap();
        for key in [
            "type",
            "data",
            "conversation_id",
            "active_member_id",
            "status",
            "delta",
            "timestamp",
        ] {
            assert!(obj.contains_key(key), "missing {key}");
        }
        assert_eq!(json["type"], "heartbeat");
        assert_eq!(json["status"], "ack");
        assert!(json["conversation_id"].is_null());
    }

    #[test]
    fn decode_of_encoded_preserves_fields() {
        let original = WireMessage::chat_delta("Hel", Some("conv_1".into()))
            .with_active_member(Some("m2".into()));
        let decoded = decode(&encode(&original)).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn error_message_shape() {
        let msg = WireMessage::error("BUSY", "a chat reply is already in progress");
        assert_eq!(msg.kind, MessageType::StatusUpdate);
        assert_eq!(msg.status.as_deref(), Some(status::ERROR));
        assert_eq!(msg.data_str("code"), Some("BUSY"));
    }

    #[test]
    fn welcome_payload() {
        let msg = WireMessage::welcome(
            &ConnectionId::from("conn_1"),
            &UserId::from("u1"),
            Some(&FamilyId::from("f1")),
            30,
        );
        assert_eq!(msg.data_str("connection_id"), Some("conn_1"));
        assert_eq!(msg.data_str("user_id"), Some("u1"));
        assert_eq!(msg.data_str("family_id"), Some("f1"));
        assert_eq!(msg.data["heartbeat_interval_secs"], 30);
    }

    #[test]
    fn scalar_data_is_wrapped() {
        let msg = WireMessage::notification(json!("refill due"));
        assert_eq!(msg.data_str("value"), Some("refill due"));
    }

    #[test]
    fn empty_strings_are_not_data() {
        let msg = decode(r#"{"type":"general_chat","data":{"message":""}}"#).unwrap();
        assert_eq!(msg.data_str("message"), None);
    }
}
