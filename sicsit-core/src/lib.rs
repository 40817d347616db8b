//! # sicsit-core
//!
//! Core library for the SIC-SIT semantic session protocol.
//!
//! This crate provides the packet codec, the semantic firewall, the
//! signature engine and chain, the SYN / SYN-ACK / ACK handshake state
//! machine, drift detection, the shared nonce ledger, governance dispatch
//! and the bounded interfaces to external services.

pub mod canonical;
pub mod drift;
pub mod error;
pub mod firewall;
pub mod governance;
pub mod handshake;
pub mod ledger;
pub mod message;
pub mod packet;
pub mod services;
pub mod session;
pub mod signature;
pub mod state;

pub use canonical::{canonicalize_json, digest_hex, digest_value, Digest};
pub use drift::{CategoryScorer, DriftDetector, DriftResult, DriftScorer, KeywordOverlapScorer};
pub use error::{ErrorClass, FirewallCode, SitCode, SitError, SitResult};
pub use firewall::{AuditEntry, Constraint, Firewall, FirewallAction, FirewallResult, Policy, Rule};
pub use governance::{GovernanceAction, GovernanceTable, GovernanceVerdict, OperationContext, Violation};
pub use handshake::{HandshakeConfig, HandshakeContext, HandshakeMachine};
pub use ledger::NonceLedger;
pub use message::{derive_session_id, fresh_nonce, Ack, HandshakeMessage, SemanticBoundary, Syn, SynAck};
pub use packet::{Packet, PacketCodec};
pub use services::{
    CausalClock, ConsensusService, Degradable, EntropyScorer, LocalLamportClock, ServicePolicy,
    Services,
};
pub use session::SitState;
pub use signature::{Identity, KeyDirectory, KeyRing, SignatureChain, SignedEntry};
pub use state::{HandshakeEvent, Role, SessionStatus};

/// Protocol version
pub const PROTOCOL_VERSION: &str = "0.1";
