//! Wire envelope carried as a packet payload.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use sicsit_core::{Ack, SitError, SitResult, Syn, SynAck};

/// Everything a node sends to a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frame {
    Syn(Syn),
    SynAck(SynAck),
    Ack(Ack),
    /// Application payload on an established session.
    Exchange {
        session_id: Uuid,
        lamport: u64,
        body: Map<String, Value>,
    },
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Syn(_) => "SYN",
            Self::SynAck(_) => "SYN_ACK",
            Self::Ack(_) => "ACK",
            Self::Exchange { .. } => "EXCHANGE",
        }
    }

    /// Sender claimed inside a handshake frame.
    pub fn claimed_sender(&self) -> Option<&str> {
        match self {
            Self::Syn(m) => Some(&m.entity_id),
            Self::SynAck(m) => Some(&m.entity_id),
            Self::Ack(m) => Some(&m.entity_id),
            Self::Exchange { .. } => None,
        }
    }

    pub fn to_payload(&self) -> SitResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_payload(payload: &Map<String, Value>) -> SitResult<Self> {
        serde_json::from_value(Value::Object(payload.clone()))
            .map_err(|e| SitError::MalformedPayload(format!("not a SIT frame: {}", e)))
    }
}

/// The part of a raw payload that policy applies to: the body of an
/// exchange, or the whole payload of a handshake frame.
pub fn intent_view(payload: &Map<String, Value>) -> &Map<String, Value> {
    let is_exchange = payload.get("type").and_then(Value::as_str) == Some("EXCHANGE");
    match payload.get("body") {
        Some(Value::Object(body)) if is_exchange => body,
        _ => payload,
    }
}
