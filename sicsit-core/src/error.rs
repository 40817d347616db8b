//! Error types and stable outcome codes for SIC-SIT.
//!
//! Two namespaces are used on the wire and in logs:
//! - `SIC-FW-0xx` for firewall outcomes ([`FirewallCode`])
//! - `SIT-ERR-0xx` for codec, handshake and session outcomes ([`SitCode`])
//!
//! A code is never reused for a different condition.

use thiserror::Error;
use uuid::Uuid;

/// Firewall outcome codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum FirewallCode {
    /// No rule was violated.
    #[serde(rename = "SIC-FW-000", alias = "FW_PASS")]
    Pass,
    /// A numeric or structural policy bound was violated.
    #[serde(rename = "SIC-FW-001", alias = "FW_POLICY_VIOLATION")]
    PolicyViolation,
    /// A deny pattern matched a string leaf of the payload.
    #[serde(rename = "SIC-FW-002", alias = "FW_INJECTION_DETECTED")]
    InjectionDetected,
    /// A required field was absent or empty.
    #[serde(rename = "SIC-FW-003", alias = "FW_MISSING_REQUIRED")]
    MissingRequired,
    /// A forbidden field was present.
    #[serde(rename = "SIC-FW-004", alias = "FW_FORBIDDEN_FIELD")]
    ForbiddenField,
    /// The requester's clearance level was below the rule's minimum.
    #[serde(rename = "SIC-FW-006", alias = "FW_CLEARANCE_INSUFFICIENT")]
    ClearanceInsufficient,
}

impl FirewallCode {
    /// Stable external identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "SIC-FW-000",
            Self::PolicyViolation => "SIC-FW-001",
            Self::InjectionDetected => "SIC-FW-002",
            Self::MissingRequired => "SIC-FW-003",
            Self::ForbiddenField => "SIC-FW-004",
            Self::ClearanceInsufficient => "SIC-FW-006",
        }
    }

    /// Symbolic name used in policy documents.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pass => "FW_PASS",
            Self::PolicyViolation => "FW_POLICY_VIOLATION",
            Self::InjectionDetected => "FW_INJECTION_DETECTED",
            Self::MissingRequired => "FW_MISSING_REQUIRED",
            Self::ForbiddenField => "FW_FORBIDDEN_FIELD",
            Self::ClearanceInsufficient => "FW_CLEARANCE_INSUFFICIENT",
        }
    }
}

impl std::fmt::Display for FirewallCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Codec, handshake and session outcome codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SitCode {
    #[serde(rename = "SIT-ERR-001", alias = "UNEXPECTED_INTENT_SOURCE")]
    UnexpectedIntentSource,
    #[serde(rename = "SIT-ERR-002", alias = "SIGNATURE_INVALID")]
    SignatureInvalid,
    #[serde(rename = "SIT-ERR-003", alias = "REPLAY_DETECTED")]
    ReplayDetected,
    #[serde(rename = "SIT-ERR-004", alias = "NONCE_MISMATCH")]
    NonceMismatch,
    #[serde(rename = "SIT-ERR-005", alias = "DEADLINE_EXPIRED")]
    DeadlineExpired,
    #[serde(rename = "SIT-ERR-006", alias = "CHAIN_BROKEN")]
    ChainBroken,
    #[serde(rename = "SIT-ERR-007", alias = "SEMANTIC_DRIFT_DETECTED")]
    SemanticDriftDetected,
    #[serde(rename = "SIT-ERR-008", alias = "MALFORMED_PAYLOAD")]
    MalformedPayload,
    #[serde(rename = "SIT-ERR-009", alias = "HASH_MISMATCH")]
    HashMismatch,
    #[serde(rename = "SIT-ERR-010", alias = "EXPIRED")]
    Expired,
    #[serde(rename = "SIT-ERR-011", alias = "SCOPE_MISMATCH")]
    ScopeMismatch,
    #[serde(rename = "SIT-ERR-012", alias = "UNKNOWN_PEER")]
    UnknownPeer,
    #[serde(rename = "SIT-ERR-013", alias = "UNKNOWN_SESSION")]
    UnknownSession,
    #[serde(rename = "SIT-ERR-014", alias = "NOT_ESTABLISHED")]
    NotEstablished,
    #[serde(rename = "SIT-ERR-015", alias = "LEDGER_SATURATED")]
    LedgerSaturated,
    #[serde(rename = "SIT-ERR-016", alias = "MISDIRECTED")]
    Misdirected,
    #[serde(rename = "SIT-ERR-017", alias = "POLICY_INVALID")]
    PolicyInvalid,
    #[serde(rename = "SIT-ERR-018", alias = "CONFIG_INVALID")]
    ConfigInvalid,
    #[serde(rename = "SIT-ERR-019", alias = "SERVICE_UNAVAILABLE")]
    ServiceUnavailable,
}

impl SitCode {
    /// Stable external identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnexpectedIntentSource => "SIT-ERR-001",
            Self::SignatureInvalid => "SIT-ERR-002",
            Self::ReplayDetected => "SIT-ERR-003",
            Self::NonceMismatch => "SIT-ERR-004",
            Self::DeadlineExpired => "SIT-ERR-005",
            Self::ChainBroken => "SIT-ERR-006",
            Self::SemanticDriftDetected => "SIT-ERR-007",
            Self::MalformedPayload => "SIT-ERR-008",
            Self::HashMismatch => "SIT-ERR-009",
            Self::Expired => "SIT-ERR-010",
            Self::ScopeMismatch => "SIT-ERR-011",
            Self::UnknownPeer => "SIT-ERR-012",
            Self::UnknownSession => "SIT-ERR-013",
            Self::NotEstablished => "SIT-ERR-014",
            Self::LedgerSaturated => "SIT-ERR-015",
            Self::Misdirected => "SIT-ERR-016",
            Self::PolicyInvalid => "SIT-ERR-017",
            Self::ConfigInvalid => "SIT-ERR-018",
            Self::ServiceUnavailable => "SIT-ERR-019",
        }
    }
}

impl std::fmt::Display for SitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broad failure taxonomy, used to decide propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed, hash-mismatched or stale packets.
    Structural,
    /// Firewall denials.
    Policy,
    /// Handshake ordering, replay and deadline violations.
    Protocol,
    /// Signature and chain failures.
    Cryptographic,
    /// Divergence from a session's declared boundary.
    Drift,
    /// Invalid local configuration or policy documents.
    Configuration,
    /// External collaborator unavailable.
    Service,
}

/// SIC-SIT errors.
#[derive(Debug, Error)]
pub enum SitError {
    /// Payload is not a structured map or cannot be serialized.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("packet hash mismatch: expected {expected}, computed {computed}")]
    HashMismatch { expected: String, computed: String },

    #[error("packet expired: created at {created_at}, freshness window {window_ms}ms")]
    Expired { created_at: String, window_ms: i64 },

    #[error("packet addressed to {dst}, local entity is {local}")]
    Misdirected { dst: String, local: String },

    /// Firewall denial, always carrying the rule's code.
    #[error("firewall denied ({code}): {reason}")]
    Denied { code: FirewallCode, reason: String },

    /// Out-of-order or wrongly-sourced handshake message.
    #[error("unexpected intent source: {0}")]
    UnexpectedIntentSource(String),

    #[error("signature verification failed")]
    SignatureInvalid,

    #[error("replay detected: nonce {nonce} from {entity_id} already consumed")]
    ReplayDetected { entity_id: String, nonce: String },

    #[error("nonce mismatch: expected {expected}, got {got}")]
    NonceMismatch { expected: String, got: String },

    #[error("echoed scope does not match the proposed scope: {0}")]
    ScopeMismatch(String),

    #[error("handshake deadline expired for session {0}")]
    DeadlineExpired(Uuid),

    #[error("signature chain broken at entry {0}")]
    ChainBroken(u64),

    #[error("semantic drift detected: score {score:.3} exceeds threshold {threshold:.3}")]
    SemanticDrift { score: f64, threshold: f64 },

    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    #[error("unknown session: {0}")]
    UnknownSession(Uuid),

    #[error("session {0} is not established")]
    NotEstablished(Uuid),

    #[error("nonce ledger saturated ({0} live entries)")]
    LedgerSaturated(usize),

    #[error("invalid policy: {0}")]
    PolicyInvalid(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Key or signature encoding error.
    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("service unavailable: {service}: {reason}")]
    ServiceUnavailable { service: &'static str, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SitError {
    /// Stable external identifier for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Denied { code, .. } => code.as_str(),
            other => other.sit_code().map(|c| c.as_str()).unwrap_or("SIT-ERR-000"),
        }
    }

    /// The `SIT-ERR` code, if this is not a firewall denial.
    pub fn sit_code(&self) -> Option<SitCode> {
        let code = match self {
            Self::MalformedPayload(_) | Self::Serialization(_) => SitCode::MalformedPayload,
            Self::HashMismatch { .. } => SitCode::HashMismatch,
            Self::Expired { .. } => SitCode::Expired,
            Self::Misdirected { .. } => SitCode::Misdirected,
            Self::Denied { .. } => return None,
            Self::UnexpectedIntentSource(_) => SitCode::UnexpectedIntentSource,
            Self::SignatureInvalid | Self::Crypto(_) => SitCode::SignatureInvalid,
            Self::ReplayDetected { .. } => SitCode::ReplayDetected,
            Self::NonceMismatch { .. } => SitCode::NonceMismatch,
            Self::ScopeMismatch(_) => SitCode::ScopeMismatch,
            Self::DeadlineExpired(_) => SitCode::DeadlineExpired,
            Self::ChainBroken(_) => SitCode::ChainBroken,
            Self::SemanticDrift { .. } => SitCode::SemanticDriftDetected,
            Self::UnknownPeer(_) => SitCode::UnknownPeer,
            Self::UnknownSession(_) => SitCode::UnknownSession,
            Self::NotEstablished(_) => SitCode::NotEstablished,
            Self::LedgerSaturated(_) => SitCode::LedgerSaturated,
            Self::PolicyInvalid(_) => SitCode::PolicyInvalid,
            Self::Config(_) => SitCode::ConfigInvalid,
            Self::ServiceUnavailable { .. } => SitCode::ServiceUnavailable,
        };
        Some(code)
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::MalformedPayload(_)
            | Self::Serialization(_)
            | Self::HashMismatch { .. }
            | Self::Expired { .. }
            | Self::Misdirected { .. } => ErrorClass::Structural,
            Self::Denied { .. } => ErrorClass::Policy,
            Self::UnexpectedIntentSource(_)
            | Self::ReplayDetected { .. }
            | Self::NonceMismatch { .. }
            | Self::ScopeMismatch(_)
            | Self::DeadlineExpired(_)
            | Self::UnknownPeer(_)
            | Self::UnknownSession(_)
            | Self::NotEstablished(_)
            | Self::LedgerSaturated(_) => ErrorClass::Protocol,
            Self::SignatureInvalid | Self::Crypto(_) | Self::ChainBroken(_) => {
                ErrorClass::Cryptographic
            }
            Self::SemanticDrift { .. } => ErrorClass::Drift,
            Self::PolicyInvalid(_) | Self::Config(_) => ErrorClass::Configuration,
            Self::ServiceUnavailable { .. } => ErrorClass::Service,
        }
    }

    /// Whether a caller may retry. Protocol failures are retried with a
    /// fresh handshake; structural and cryptographic failures never are.
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Protocol | ErrorClass::Service)
    }
}

/// Result type alias for SIC-SIT operations.
pub type SitResult<T> = Result<T, SitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn firewall_code_display() {
        assert_eq!(FirewallCode::Pass.to_string(), "SIC-FW-000");
        assert_eq!(FirewallCode::PolicyViolation.to_string(), "SIC-FW-001");
        assert_eq!(FirewallCode::InjectionDetected.to_string(), "SIC-FW-002");
        assert_eq!(FirewallCode::MissingRequired.to_string(), "SIC-FW-003");
        assert_eq!(FirewallCode::ForbiddenField.to_string(), "SIC-FW-004");
        assert_eq!(FirewallCode::ClearanceInsufficient.to_string(), "SIC-FW-006");
    }

    #[test]
    fn firewall_code_serde() {
        let json = serde_json::to_string(&FirewallCode::MissingRequired).unwrap();
        assert_eq!(json, "\"SIC-FW-003\"");

        let parsed: FirewallCode = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, FirewallCode::MissingRequired);

        let by_name: FirewallCode = serde_json::from_str("\"FW_MISSING_REQUIRED\"").unwrap();
        assert_eq!(by_name, FirewallCode::MissingRequired);
    }

    #[test]
    fn sit_codes_are_unique() {
        let codes = [
            SitCode::UnexpectedIntentSource,
            SitCode::SignatureInvalid,
            SitCode::ReplayDetected,
            SitCode::NonceMismatch,
            SitCode::DeadlineExpired,
            SitCode::ChainBroken,
            SitCode::SemanticDriftDetected,
            SitCode::MalformedPayload,
            SitCode::HashMismatch,
            SitCode::Expired,
            SitCode::ScopeMismatch,
            SitCode::UnknownPeer,
            SitCode::UnknownSession,
            SitCode::NotEstablished,
            SitCode::LedgerSaturated,
            SitCode::Misdirected,
            SitCode::PolicyInvalid,
            SitCode::ConfigInvalid,
            SitCode::ServiceUnavailable,
        ];
        let unique: std::collections::HashSet<_> = codes.iter().map(|c| c.as_str()).collect();
        assert_eq!(unique.len(), codes.len());
    }

    #[test]
    fn error_codes_and_classes() {
        let denied = SitError::Denied {
            code: FirewallCode::InjectionDetected,
            reason: "pattern matched".to_string(),
        };
        assert_eq!(denied.code(), "SIC-FW-002");
        assert_eq!(denied.class(), ErrorClass::Policy);
        assert!(!denied.is_retryable());

        let replay = SitError::ReplayDetected {
            entity_id: "alice".to_string(),
            nonce: "00".to_string(),
        };
        assert_eq!(replay.code(), "SIT-ERR-003");
        assert!(replay.is_retryable());

        assert_eq!(SitError::SignatureInvalid.class(), ErrorClass::Cryptographic);
        assert!(!SitError::ChainBroken(2).is_retryable());
    }
}
