//! Signature engine.
//!
//! Ed25519 identities, a shared key directory and the per-session hash-linked
//! signature chain. Each chain entry signs its link digest
//!
//! `L_i = SHA256("sit-chain-v1" || seq_be || payload_digest || L_{i-1})`
//!
//! with `L_{-1}` all zeroes, so reordering, dropping or editing any entry
//! breaks every later signature.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::canonical::{digest_hex, parse_digest, Digest, ZERO_DIGEST};
use crate::error::{SitError, SitResult};

const CHAIN_DOMAIN: &[u8] = b"sit-chain-v1";

/// An entity's id together with its signing key.
pub struct Identity {
    entity_id: String,
    signing_key: SigningKey,
}

impl Identity {
    /// Generate a fresh identity from the OS RNG.
    pub fn generate(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_bytes(entity_id: impl Into<String>, secret: &[u8; 32]) -> Self {
        Self {
            entity_id: entity_id.into(),
            signing_key: SigningKey::from_bytes(secret),
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Hex-encoded public key, as published to peers.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying_key().as_bytes())
    }

    /// Sign a digest with this identity's key.
    pub fn sign(&self, digest: &Digest) -> Signature {
        sign(&self.signing_key, digest)
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("entity_id", &self.entity_id)
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

/// Sign a message digest.
pub fn sign(secret: &SigningKey, digest: &Digest) -> Signature {
    secret.sign(digest)
}

/// Verify a signature over a message digest.
///
/// Uses strict verification, which rejects small-order keys and
/// non-canonical signature encodings.
pub fn verify(public_key: &VerifyingKey, digest: &Digest, signature: &Signature) -> bool {
    public_key.verify_strict(digest, signature).is_ok()
}

/// Base64-encode a signature for the wire.
pub fn encode_signature(signature: &Signature) -> String {
    base64::engine::general_purpose::STANDARD.encode(signature.to_bytes())
}

/// Decode a base64 wire signature.
pub fn decode_signature(encoded: &str) -> SitResult<Signature> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| SitError::Crypto(format!("Invalid base64: {}", e)))?;

    Signature::from_slice(&bytes)
        .map_err(|e| SitError::Crypto(format!("Invalid signature format: {}", e)))
}

/// Decode a hex-encoded Ed25519 public key.
pub fn decode_public_key(encoded: &str) -> SitResult<VerifyingKey> {
    let bytes = hex::decode(encoded)
        .map_err(|e| SitError::Crypto(format!("Invalid public key hex: {}", e)))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| SitError::Crypto("Public key must be 32 bytes".to_string()))?;

    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| SitError::Crypto(format!("Invalid public key: {}", e)))
}

/// Lookup of entity public keys.
pub trait KeyDirectory: Send + Sync {
    fn public_key(&self, entity_id: &str) -> Option<VerifyingKey>;
}

impl KeyDirectory for HashMap<String, VerifyingKey> {
    fn public_key(&self, entity_id: &str) -> Option<VerifyingKey> {
        self.get(entity_id).copied()
    }
}

/// Shared, read-mostly key directory.
#[derive(Debug, Default)]
pub struct KeyRing {
    keys: RwLock<HashMap<String, VerifyingKey>>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace an entity's public key.
    pub fn register(&self, entity_id: impl Into<String>, key: VerifyingKey) {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entity_id.into(), key);
    }

    /// Register a hex-encoded public key.
    pub fn register_hex(&self, entity_id: impl Into<String>, encoded: &str) -> SitResult<()> {
        self.register(entity_id, decode_public_key(encoded)?);
        Ok(())
    }

    pub fn remove(&self, entity_id: &str) -> Option<VerifyingKey> {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(entity_id)
    }

    pub fn len(&self) -> usize {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyDirectory for KeyRing {
    fn public_key(&self, entity_id: &str) -> Option<VerifyingKey> {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity_id)
            .copied()
    }
}

/// One link of a session's signature chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEntry {
    pub sequence_no: u64,
    /// Hex SHA-256 of the recorded payload.
    pub payload_digest: String,
    pub signer_id: String,
    /// Base64 Ed25519 signature over the link digest.
    pub signature: String,
}

/// Link digest binding an entry to its predecessor.
pub fn link_digest(sequence_no: u64, payload_digest: &Digest, previous: &Digest) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(CHAIN_DOMAIN);
    hasher.update(sequence_no.to_be_bytes());
    hasher.update(payload_digest);
    hasher.update(previous);
    hasher.finalize().into()
}

/// Append-only, hash-linked sequence of signed entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignatureChain {
    entries: Vec<SignedEntry>,
}

impl SignatureChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[SignedEntry] {
        &self.entries
    }

    pub fn last(&self) -> Option<&SignedEntry> {
        self.entries.last()
    }

    /// Sign `payload_digest` as the next entry.
    ///
    /// The current last entry is verified first; if it does not verify the
    /// chain is not extended and `ChainBroken` is returned.
    pub fn append_entry(
        &mut self,
        signer: &Identity,
        payload_digest: &Digest,
        keys: &dyn KeyDirectory,
    ) -> SitResult<SignedEntry> {
        let previous = self.verified_head(keys)?;
        let sequence_no = self.entries.len() as u64;
        let link = link_digest(sequence_no, payload_digest, &previous);

        let entry = SignedEntry {
            sequence_no,
            payload_digest: digest_hex(payload_digest),
            signer_id: signer.entity_id().to_string(),
            signature: encode_signature(&signer.sign(&link)),
        };
        self.entries.push(entry.clone());
        Ok(entry)
    }

    /// Walk every entry in order. Fails closed on the first bad link.
    pub fn verify_chain(&self, keys: &dyn KeyDirectory) -> bool {
        let mut previous = ZERO_DIGEST;
        for (index, entry) in self.entries.iter().enumerate() {
            match verify_link(index as u64, entry, &previous, keys) {
                Some(link) => previous = link,
                None => {
                    tracing::debug!(sequence_no = index, signer = %entry.signer_id, "Chain link failed verification");
                    return false;
                }
            }
        }
        true
    }

    /// Link digest of the last entry, after checking its signature.
    fn verified_head(&self, keys: &dyn KeyDirectory) -> SitResult<Digest> {
        let mut previous = ZERO_DIGEST;
        let last_index = match self.entries.len() {
            0 => return Ok(previous),
            n => n - 1,
        };

        for (index, entry) in self.entries.iter().enumerate() {
            let broken = || SitError::ChainBroken(index as u64);
            if entry.sequence_no != index as u64 {
                return Err(broken());
            }
            let payload = parse_digest(&entry.payload_digest).map_err(|_| broken())?;
            let link = link_digest(entry.sequence_no, &payload, &previous);
            if index == last_index {
                verify_entry_signature(entry, &link, keys).ok_or_else(broken)?;
            }
            previous = link;
        }
        Ok(previous)
    }
}

fn verify_link(
    index: u64,
    entry: &SignedEntry,
    previous: &Digest,
    keys: &dyn KeyDirectory,
) -> Option<Digest> {
    if entry.sequence_no != index {
        return None;
    }
    let payload = parse_digest(&entry.payload_digest).ok()?;
    let link = link_digest(entry.sequence_no, &payload, previous);
    verify_entry_signature(entry, &link, keys)?;
    Some(link)
}

fn verify_entry_signature(entry: &SignedEntry, link: &Digest, keys: &dyn KeyDirectory) -> Option<()> {
    let key = keys.public_key(&entry.signer_id)?;
    let signature = decode_signature(&entry.signature).ok()?;
    verify(&key, link, &signature).then_some(())
}
