// Wire frames for the pulse chat protocol.
//
// The same JSON envelope travels on both legs: client <-> node over the
// WebSocket, and node <-> node over the broker. Field names are camelCase
// and frame tags SCREAMING_SNAKE to stay compatible with the platform's
// deployed clients. Unknown fields are ignored on decode.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Sender id used for server-synthesized frames (acks, errors, notices).
pub const SYSTEM_SENDER: &str = "system";

/// Closed set of frame tags. Adding a variant forces every dispatch match
/// to be revisited at compile time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameType {
    Connected,
    Disconnected,
    ConnectionReplaced,
    ChatMessage,
    MessageAck,
    Heartbeat,
    HeartbeatAck,
    ReadReceipt,
    Typing,
    OnlineStatus,
    SystemNotification,
    Error,
}

/// Payload kind of a `CHAT_MESSAGE` frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChatMessageKind {
    #[default]
    Text,
    Image,
    Voice,
    Video,
    File,
    Emoji,
    System,
}

/// Metadata attached to non-text chat messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MediaMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// One JSON object per frame, shared by the client and inter-node legs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_message_type: Option<ChatMessageKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    /// Server-assigned id, present once a chat message has been saved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Client-generated id, echoed back in acks and errors for dedup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_metadata: Option<MediaMetadata>,
    /// Epoch milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_data: Option<Map<String, Value>>,
}

impl Envelope {
    pub fn new(frame_type: FrameType) -> Self {
        Self {
            frame_type,
            chat_message_type: None,
            sender_id: None,
            receiver_id: None,
            chat_id: None,
            message_id: None,
            temp_message_id: None,
            content: None,
            media_metadata: None,
            timestamp: None,
            extra_data: None,
        }
    }

    /// A server-originated frame addressed to `receiver_id`.
    pub fn system(frame_type: FrameType, receiver_id: impl Into<String>) -> Self {
        let mut envelope = Self::new(frame_type);
        envelope.sender_id = Some(SYSTEM_SENDER.to_string());
        envelope.receiver_id = Some(receiver_id.into());
        envelope.timestamp = Some(now_millis());
        envelope
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_temp_message_id(mut self, temp_message_id: Option<String>) -> Self {
        self.temp_message_id = temp_message_id;
        self
    }

    /// True for frames the server synthesizes itself; these must never feed
    /// back into failure bookkeeping.
    pub fn is_system_frame(&self) -> bool {
        self.frame_type == FrameType::SystemNotification
            || self.sender_id.as_deref() == Some(SYSTEM_SENDER)
    }

    /// Message id for a read receipt: `extraData.messageId` takes priority
    /// over the envelope's own `messageId`.
    pub fn referenced_message_id(&self) -> Option<&str> {
        if let Some(extra) = &self.extra_data {
            if let Some(Value::String(id)) = extra.get("messageId") {
                return Some(id);
            }
        }
        self.message_id.as_deref()
    }
}

pub fn decode_frame(raw: &str) -> Result<Envelope, serde_json::Error> {
    serde_json::from_str::<Envelope>(raw)
}

pub fn encode_frame(envelope: &Envelope) -> Result<String, serde_json::Error> {
    serde_json::to_string(envelope)
}

/// Wall-clock epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// One-shot directive telling a node to evict a user's stale session after
/// the user reconnected elsewhere. Fire-and-forget over the broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectNotice {
    pub user_id: String,
    pub target_node_id: String,
    pub source_node_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: i64,
}

/// Payload published to the external push channel for offline receivers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PushNotification {
    pub receiver_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    /// One of `match` / `chat` / `media`; this service only emits `chat`.
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_tags_are_screaming_snake() {
        let encoded = serde_json::to_string(&FrameType::ConnectionReplaced)
            .expect("frame type should encode");
        assert_eq!(encoded, "\"CONNECTION_REPLACED\"");
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let raw = r#"{"type":"HEARTBEAT","content":"ping","futureField":42}"#;
        let envelope = decode_frame(raw).expect("frame with unknown field should decode");
        assert_eq!(envelope.frame_type, FrameType::Heartbeat);
        assert_eq!(envelope.content.as_deref(), Some("ping"));
    }

    #[test]
    fn unknown_frame_type_is_a_decode_error() {
        let raw = r#"{"type":"TELEPORT","senderId":"u1"}"#;
        assert!(decode_frame(raw).is_err());
    }

    #[test]
    fn referenced_message_id_prefers_extra_data() {
        let raw = r#"{
            "type":"READ_RECEIPT",
            "messageId":"own",
            "extraData":{"messageId":"from-extra"}
        }"#;
        let envelope = decode_frame(raw).expect("read receipt should decode");
        assert_eq!(envelope.referenced_message_id(), Some("from-extra"));
    }

    #[test]
    fn system_frames_are_flagged() {
        let ack = Envelope::system(FrameType::MessageAck, "u1");
        assert!(ack.is_system_frame());

        let chat = Envelope::new(FrameType::ChatMessage);
        assert!(!chat.is_system_frame());
    }

    #[test]
    fn absent_fields_are_omitted_on_encode() {
        let frame = Envelope::new(FrameType::HeartbeatAck).with_content("pong");
        let encoded = encode_frame(&frame).expect("frame should encode");
        assert_eq!(encoded, r#"{"type":"HEARTBEAT_ACK","content":"pong"}"#);
    }
}
