//! Packet codec.
//!
//! A [`Packet`] is the canonical unit exchanged between entities. Its hash
//! covers the payload, both model ids and the creation timestamp, so any
//! mutation after creation is detected by [`PacketCodec::validate_packet`].

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::canonical::{digest_hex, digest_value, timestamp_now, timestamp_text};
use crate::error::{SitError, SitResult};

/// Default freshness window in milliseconds.
pub const DEFAULT_FRESHNESS_MS: i64 = 30_000;

/// Structured unit of communication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub payload: Map<String, Value>,
    pub src_model: String,
    pub dst_model: String,
    pub created_at: DateTime<Utc>,
    pub packet_hash: String,
}

impl Packet {
    /// Recompute the hash over the packet's current contents.
    pub fn compute_hash(&self) -> String {
        compute_packet_hash(&self.payload, &self.src_model, &self.dst_model, &self.created_at)
    }
}

/// Hash over the canonical form of the hashed packet fields.
pub fn compute_packet_hash(
    payload: &Map<String, Value>,
    src_model: &str,
    dst_model: &str,
    created_at: &DateTime<Utc>,
) -> String {
    let hashed = serde_json::json!({
        "payload": payload,
        "src_model": src_model,
        "dst_model": dst_model,
        "created_at": timestamp_text(created_at),
    });
    digest_hex(&digest_value(&hashed))
}

/// Builds and validates packets against a freshness window.
#[derive(Debug, Clone, Copy)]
pub struct PacketCodec {
    freshness: Duration,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(DEFAULT_FRESHNESS_MS)
    }
}

impl PacketCodec {
    /// Create a codec with the given freshness window.
    pub fn new(freshness_ms: i64) -> Self {
        Self {
            freshness: Duration::milliseconds(freshness_ms),
        }
    }

    pub fn freshness_ms(&self) -> i64 {
        self.freshness.num_milliseconds()
    }

    /// Create a packet from a JSON payload, which must be an object.
    pub fn create_packet(
        &self,
        payload: Value,
        src_model: impl Into<String>,
        dst_model: impl Into<String>,
    ) -> SitResult<Packet> {
        let payload = match payload {
            Value::Object(map) => map,
            other => {
                return Err(SitError::MalformedPayload(format!(
                    "payload must be a structured map, got {}",
                    json_kind(&other)
                )))
            }
        };

        let src_model = src_model.into();
        let dst_model = dst_model.into();
        if src_model.trim().is_empty() || dst_model.trim().is_empty() {
            return Err(SitError::MalformedPayload(
                "src_model and dst_model must be non-empty".to_string(),
            ));
        }

        let created_at = timestamp_now();
        let packet_hash = compute_packet_hash(&payload, &src_model, &dst_model, &created_at);

        Ok(Packet {
            payload,
            src_model,
            dst_model,
            created_at,
            packet_hash,
        })
    }

    /// Create a packet from any serializable payload.
    pub fn create_packet_from<T: Serialize>(
        &self,
        payload: &T,
        src_model: impl Into<String>,
        dst_model: impl Into<String>,
    ) -> SitResult<Packet> {
        let value = serde_json::to_value(payload)
            .map_err(|e| SitError::MalformedPayload(format!("unserializable payload: {}", e)))?;
        self.create_packet(value, src_model, dst_model)
    }

    /// Validate hash and freshness against the current time.
    pub fn validate_packet(&self, packet: &Packet) -> SitResult<()> {
        self.validate_packet_at(packet, Utc::now())
    }

    /// Validate hash and freshness against an explicit clock.
    pub fn validate_packet_at(&self, packet: &Packet, now: DateTime<Utc>) -> SitResult<()> {
        let computed = packet.compute_hash();
        if computed != packet.packet_hash {
            return Err(SitError::HashMismatch {
                expected: packet.packet_hash.clone(),
                computed,
            });
        }

        let age = now.signed_duration_since(packet.created_at);
        if age.abs() > self.freshness {
            return Err(SitError::Expired {
                created_at: timestamp_text(&packet.created_at),
                window_ms: self.freshness.num_milliseconds(),
            });
        }

        Ok(())
    }

    /// Serialize a packet to its JSON wire form.
    pub fn encode(&self, packet: &Packet) -> SitResult<Vec<u8>> {
        Ok(serde_json::to_vec(packet)?)
    }

    /// Parse and validate a packet from its JSON wire form.
    pub fn decode(&self, bytes: &[u8]) -> SitResult<Packet> {
        let packet: Packet = serde_json::from_slice(bytes)
            .map_err(|e| SitError::MalformedPayload(format!("invalid packet: {}", e)))?;
        self.validate_packet(&packet)?;
        Ok(packet)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
