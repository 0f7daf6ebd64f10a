use crate::core::{Block, Transaction};
use crate::error::Result;
use crate::utils::current_timestamp;
use serde::{Deserialize, Serialize};

/// Protocol version advertised in handshakes
pub const PROTOCOL_VERSION: u32 = 1;

/// Wire envelope. One JSON value per logical message; the streaming
/// serde_json deserializer on the receiving side preserves message
/// boundaries without extra framing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(flatten)]
    pub payload: MessagePayload,
    pub timestamp: i64,
}

impl Message {
    pub fn new(payload: MessagePayload) -> Result<Message> {
        Ok(Message {
            payload,
            timestamp: current_timestamp()?,
        })
    }
}

/// The fixed set of protocol messages, tagged on the wire as
/// `{"type": "...", "data": ...}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessagePayload {
    Handshake(HandshakePayload),
    Ping,
    Pong,
    GetPeers,
    Peers { addrs: Vec<String> },
    GetBlocks { from: u64, to: u64 },
    Blocks { blocks: Vec<Block> },
    Block { block: Block },
    Transaction { transaction: Transaction },
    GetTransactions,
}

/// Handshake body. Fields are optional on the wire so that presence can be
/// validated explicitly: a handshake without version or node_id is
/// malformed and the connection is dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakePayload {
    pub version: Option<u32>,
    pub node_id: Option<String>,
    pub listen_addr: Option<String>,
    pub height: Option<u64>,
}

impl HandshakePayload {
    pub fn new(node_id: String, listen_addr: String, height: u64) -> HandshakePayload {
        HandshakePayload {
            version: Some(PROTOCOL_VERSION),
            node_id: Some(node_id),
            listen_addr: Some(listen_addr),
            height: Some(height),
        }
    }

    /// A handshake is well-formed when both version and node id are present
    pub fn is_well_formed(&self) -> bool {
        self.version.is_some() && self.node_id.as_deref().is_some_and(|id| !id.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_tag_matches_protocol_names() {
        let msg = Message::new(MessagePayload::GetPeers).unwrap();
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "GET_PEERS");

        let msg = Message::new(MessagePayload::GetBlocks { from: 3, to: 9 }).unwrap();
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "GET_BLOCKS");
        assert_eq!(json["data"]["from"], 3);
    }

    #[test]
    fn envelope_round_trips() {
        let msg = Message::new(MessagePayload::Peers {
            addrs: vec!["127.0.0.1:7001".to_string()],
        })
        .unwrap();
        let json = serde_json::to_string(&msg).unwrap();
        let decoded: Message = serde_json::from_str(&json).unwrap();
        match decoded.payload {
            MessagePayload::Peers { addrs } => assert_eq!(addrs, vec!["127.0.0.1:7001"]),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn handshake_without_node_id_is_malformed() {
        let complete = HandshakePayload::new("node-1".to_string(), "127.0.0.1:7001".to_string(), 4);
        assert!(complete.is_well_formed());

        let missing_id = HandshakePayload {
            node_id: None,
            ..complete.clone()
        };
        assert!(!missing_id.is_well_formed());

        let missing_version = HandshakePayload {
            version: None,
            ..complete
        };
        assert!(!missing_version.is_well_formed());
    }

    #[test]
    fn handshake_json_with_missing_fields_still_parses() {
        // Presence is validated by is_well_formed, not by serde
        let json = r#"{"type":"HANDSHAKE","data":{"height":7},"timestamp":0}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        match msg.payload {
            MessagePayload::Handshake(hs) => assert!(!hs.is_well_formed()),
            other => panic!("unexpected payload: {other:?}"),
        }
    }
}
