//! Canonical serialization and digests.
//!
//! Everything that is hashed or signed goes through [`canonicalize_json`]
//! (JCS, RFC 8785 style) so both peers derive identical bytes from identical
//! values regardless of field order.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sha2::{Digest as _, Sha256};

use crate::error::{SitError, SitResult};

/// A SHA-256 digest.
pub type Digest = [u8; 32];

/// Predecessor digest of the first entry in a chain.
pub const ZERO_DIGEST: Digest = [0u8; 32];

/// JCS (RFC 8785) JSON Canonicalization.
///
/// 1. Object keys sorted lexicographically
/// 2. No whitespace
/// 3. Integers in shortest form
/// 4. Strings escaped per JSON
pub fn canonicalize_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                out.push_str(&i.to_string());
            } else if let Some(u) = n.as_u64() {
                out.push_str(&u.to_string());
            } else {
                out.push_str(&n.to_string());
            }
        }
        // Display on a string value yields its escaped JSON form.
        Value::String(_) => out.push_str(&value.to_string()),
        Value::Array(arr) => {
            out.push('[');
            for (i, element) in arr.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(element, out);
            }
            out.push(']');
        }
        Value::Object(obj) => {
            let mut keys: Vec<_> = obj.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&obj[*key], out);
            }
            out.push('}');
        }
    }
}

/// SHA-256 over raw bytes.
pub fn sha256(bytes: &[u8]) -> Digest {
    Sha256::digest(bytes).into()
}

/// SHA-256 over the canonical form of a JSON value.
pub fn digest_value(value: &Value) -> Digest {
    sha256(canonicalize_json(value).as_bytes())
}

/// Hex-encode a digest.
pub fn digest_hex(digest: &Digest) -> String {
    hex::encode(digest)
}

/// Parse a hex-encoded digest.
pub fn parse_digest(encoded: &str) -> SitResult<Digest> {
    let bytes = hex::decode(encoded)
        .map_err(|e| SitError::MalformedPayload(format!("invalid digest hex: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| SitError::MalformedPayload("digest must be 32 bytes".to_string()))
}

/// Current time truncated to whole milliseconds.
///
/// Wire timestamps are millisecond RFC 3339 so they survive a round trip
/// through JSON bit-for-bit, which keeps hashes and signatures stable.
pub fn timestamp_now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// Canonical text form of a timestamp.
pub fn timestamp_text(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}
