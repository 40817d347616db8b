//! Handshake message types.
//!
//! SYN, SYN-ACK and ACK share one signing scheme: the signature covers the
//! canonical JSON of every other field plus a kind tag, so a message of one
//! kind can never be replayed as another.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use ed25519_dalek::VerifyingKey;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::canonical::{digest_value, sha256, Digest};
use crate::error::{SitError, SitResult};
use crate::signature::{decode_signature, encode_signature, verify, Identity};

/// Declared constraints of a session, in stable order.
pub type SemanticBoundary = BTreeSet<String>;

/// Nonce length in bytes.
pub const NONCE_LEN: usize = 16;

/// Generate a fresh 128-bit nonce, hex-encoded.
pub fn fresh_nonce() -> String {
    let mut bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Session id shared by both peers, derived from the initiator's SYN.
pub fn derive_session_id(initiator_id: &str, initiator_nonce: &str) -> Uuid {
    let mut material = Vec::with_capacity(16 + initiator_id.len() + initiator_nonce.len());
    material.extend_from_slice(b"sit-session");
    material.extend_from_slice(initiator_id.as_bytes());
    material.push(0);
    material.extend_from_slice(initiator_nonce.as_bytes());

    let digest = sha256(&material);
    let mut id = [0u8; 16];
    id.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(id)
}

/// Opening message from the initiator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Syn {
    pub entity_id: String,
    pub nonce: String,
    pub intent_scope: String,
    pub semantic_boundary: SemanticBoundary,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub signature: String,
}

/// Responder's answer; `ack_nonce` echoes the SYN nonce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynAck {
    pub entity_id: String,
    pub nonce: String,
    pub ack_nonce: String,
    pub intent_scope: String,
    pub semantic_boundary: SemanticBoundary,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub signature: String,
}

/// Initiator's confirmation; `nonce` is the SYN nonce, `ack_nonce` echoes
/// the responder's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub entity_id: String,
    pub nonce: String,
    pub ack_nonce: String,
    pub intent_scope: String,
    pub semantic_boundary: SemanticBoundary,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub signature: String,
}

/// Behaviour shared by every handshake message.
pub trait HandshakeMessage: Serialize + Sized {
    /// Kind tag mixed into the signing digest.
    const KIND: &'static str;

    fn entity_id(&self) -> &str;
    fn nonce(&self) -> &str;
    fn intent_scope(&self) -> &str;
    fn semantic_boundary(&self) -> &SemanticBoundary;
    fn timestamp(&self) -> DateTime<Utc>;
    fn signature(&self) -> &str;
    fn set_signature(&mut self, signature: String);

    /// Digest the signature covers: every field except `signature`, plus
    /// the kind tag.
    fn signing_digest(&self) -> SitResult<Digest> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(ref mut map) = value {
            map.remove("signature");
            map.insert("type".to_string(), Value::String(Self::KIND.to_string()));
        }
        Ok(digest_value(&value))
    }

    /// Digest of the complete signed message, as recorded in the chain.
    fn message_digest(&self) -> SitResult<Digest> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(ref mut map) = value {
            map.insert("type".to_string(), Value::String(Self::KIND.to_string()));
        }
        Ok(digest_value(&value))
    }

    /// Sign in place with `identity`.
    fn sign_with(mut self, identity: &Identity) -> SitResult<Self> {
        let digest = self.signing_digest()?;
        self.set_signature(encode_signature(&identity.sign(&digest)));
        Ok(self)
    }

    /// Verify the signature against the sender's public key.
    fn verify_with(&self, key: &VerifyingKey) -> SitResult<()> {
        let signature = decode_signature(self.signature()).map_err(|_| SitError::SignatureInvalid)?;
        if verify(key, &self.signing_digest()?, &signature) {
            Ok(())
        } else {
            Err(SitError::SignatureInvalid)
        }
    }
}

macro_rules! impl_handshake_message {
    ($ty:ty, $kind:literal) => {
        impl HandshakeMessage for $ty {
            const KIND: &'static str = $kind;

            fn entity_id(&self) -> &str {
                &self.entity_id
            }

            fn nonce(&self) -> &str {
                &self.nonce
            }

            fn intent_scope(&self) -> &str {
                &self.intent_scope
            }

            fn semantic_boundary(&self) -> &SemanticBoundary {
                &self.semantic_boundary
            }

            fn timestamp(&self) -> DateTime<Utc> {
                self.timestamp
            }

            fn signature(&self) -> &str {
                &self.signature
            }

            fn set_signature(&mut self, signature: String) {
                self.signature = signature;
            }
        }
    };
}

impl_handshake_message!(Syn, "SIT-SYN");
impl_handshake_message!(SynAck, "SIT-SYN-ACK");
impl_handshake_message!(Ack, "SIT-ACK");
