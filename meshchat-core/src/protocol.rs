//! Meshchat wire protocol: message header, typed payloads and version.

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::identity::{MessageId, NodeId};

/// Current protocol version. Checked during the handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// One unit of mesh traffic. Header fields are fixed at the origin and relayed unchanged.
/// Encoding is JSON; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(flatten)]
    pub payload: Payload,
    pub message_id: MessageId,
    /// Origin creation time, seconds since the Unix epoch.
    pub timestamp: f64,
    pub sender_id: NodeId,
    pub sender_nickname: String,
}

/// Variant-specific body. On the wire: `"type": <tag>, "payload": {..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Payload {
    #[serde(rename = "chat_message")]
    Chat { text: String },
    #[serde(rename = "nickname_change")]
    NicknameChange {
        old_nickname: String,
        new_nickname: String,
    },
    #[serde(rename = "file_transfer")]
    FileTransfer {
        filename: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    /// Known listen addresses of other nodes (no nicknames).
    #[serde(rename = "peer_list")]
    PeerListShare { peers: Vec<SocketAddr> },
    /// First frame on every connection, in both directions.
    #[serde(rename = "handshake_announce")]
    HandshakeAnnounce {
        protocol_version: u8,
        listen_port: Option<u16>,
    },
}

impl Payload {
    /// Wire tag, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Chat { .. } => "chat_message",
            Payload::NicknameChange { .. } => "nickname_change",
            Payload::FileTransfer { .. } => "file_transfer",
            Payload::PeerListShare { .. } => "peer_list",
            Payload::HandshakeAnnounce { .. } => "handshake_announce",
        }
    }
}

impl Message {
    /// Build a message originating at this node, stamped with the current time.
    pub fn new(
        message_id: MessageId,
        sender_id: NodeId,
        sender_nickname: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            payload,
            message_id,
            timestamp: now_timestamp(),
            sender_id,
            sender_nickname: sender_nickname.into(),
        }
    }
}

/// Seconds since the Unix epoch as a float (0.0 if the clock is before the epoch).
pub fn now_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(text: &str) -> Message {
        Message::new(
            MessageId::from("m1"),
            NodeId::from("node-a"),
            "alice",
            Payload::Chat {
                text: text.to_string(),
            },
        )
    }

    #[test]
    fn wire_shape_uses_type_and_payload() {
        let value = serde_json::to_value(chat("hi")).unwrap();
        assert_eq!(value["type"], "chat_message");
        assert_eq!(value["message_id"], "m1");
        assert_eq!(value["sender_id"], "node-a");
        assert_eq!(value["sender_nickname"], "alice");
        assert_eq!(value["payload"]["text"], "hi");
        assert!(value["timestamp"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn file_data_is_base64_on_the_wire() {
        let msg = Message::new(
            MessageId::from("f1"),
            NodeId::from("node-a"),
            "alice",
            Payload::FileTransfer {
                filename: "a.bin".into(),
                data: vec![0, 1, 2, 255],
            },
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["payload"]["data"], "AAEC/w==");
        let back: Message = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let raw = r#"{"type":"teleport","payload":{},"message_id":"x","timestamp":1.0,"sender_id":"n","sender_nickname":"a"}"#;
        assert!(serde_json::from_str::<Message>(raw).is_err());
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let raw = r#"{"type":"file_transfer","payload":{"filename":"a","data":"%%%"},"message_id":"x","timestamp":1.0,"sender_id":"n","sender_nickname":"a"}"#;
        assert!(serde_json::from_str::<Message>(raw).is_err());
    }

    #[test]
    fn peer_list_addresses_are_strings() {
        let msg = Message::new(
            MessageId::from("p1"),
            NodeId::from("node-b"),
            "bob",
            Payload::PeerListShare {
                peers: vec!["127.0.0.1:5000".parse().unwrap()],
            },
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "peer_list");
        assert_eq!(value["payload"]["peers"][0], "127.0.0.1:5000");
    }
}
