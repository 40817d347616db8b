//! Session state owned by the local entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{SitError, SitResult};
use crate::message::SemanticBoundary;
use crate::signature::SignatureChain;
use crate::state::{transition, HandshakeEvent, Role, SessionStatus};

/// A semantic channel between two entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SitState {
    pub session_id: Uuid,
    pub role: Role,
    /// Initiator.
    pub entity_a: String,
    /// Responder.
    pub entity_b: String,
    pub intent_scope: String,
    pub semantic_boundary: SemanticBoundary,
    pub lamport_clock: u64,
    /// Highest lamport timestamp accepted from the peer.
    #[serde(default)]
    pub peer_lamport: u64,
    pub signature_chain: SignatureChain,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub established_at: Option<DateTime<Utc>>,
    /// Novelty attached by the entropy service, when available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub novelty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<String>,
}

impl SitState {
    /// The other side of the session, from the local point of view.
    pub fn peer_id(&self) -> &str {
        match self.role {
            Role::Initiator => &self.entity_b,
            Role::Responder => &self.entity_a,
        }
    }

    pub fn local_id(&self) -> &str {
        match self.role {
            Role::Initiator => &self.entity_a,
            Role::Responder => &self.entity_b,
        }
    }

    pub fn is_established(&self) -> bool {
        self.status == SessionStatus::Established
    }

    /// Apply an event to the status.
    pub fn apply(&mut self, event: &HandshakeEvent) -> SitResult<()> {
        self.status = transition(self.status, event)?;
        Ok(())
    }

    /// Close an established session.
    pub fn terminate(&mut self, reason: impl Into<String>) -> SitResult<()> {
        let reason = reason.into();
        self.apply(&HandshakeEvent::Terminated(reason.clone()))?;
        self.termination_reason = Some(reason);
        Ok(())
    }

    /// Merge a remote lamport timestamp: `max(local, remote) + 1`.
    pub fn observe_lamport(&mut self, remote: u64) -> u64 {
        self.lamport_clock = self.lamport_clock.max(remote).saturating_add(1);
        self.lamport_clock
    }

    /// Merge a timestamp carried by a peer exchange. Each exchange must
    /// carry a timestamp above every one accepted before it.
    pub fn accept_peer_lamport(&mut self, remote: u64) -> SitResult<u64> {
        self.check_peer_lamport(remote)?;
        self.peer_lamport = remote;
        Ok(self.observe_lamport(remote))
    }

    pub fn check_peer_lamport(&self, remote: u64) -> SitResult<()> {
        if remote <= self.peer_lamport {
            return Err(SitError::ReplayDetected {
                entity_id: self.peer_id().to_string(),
                nonce: format!("lamport {} (last accepted {})", remote, self.peer_lamport),
            });
        }
        Ok(())
    }

    /// Advance for a local event.
    pub fn tick(&mut self) -> u64 {
        self.lamport_clock = self.lamport_clock.saturating_add(1);
        self.lamport_clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn established() -> SitState {
        SitState {
            session_id: Uuid::new_v4(),
            role: Role::Responder,
            entity_a: "alice".to_string(),
            entity_b: "bob".to_string(),
            intent_scope: "billing.read".to_string(),
            semantic_boundary: ["invoices".to_string()].into_iter().collect(),
            lamport_clock: 5,
            peer_lamport: 0,
            signature_chain: SignatureChain::new(),
            status: SessionStatus::Established,
            established_at: Some(Utc::now()),
            novelty: None,
            termination_reason: None,
        }
    }

    #[test]
    fn peer_and_local_follow_role() {
        let mut state = established();
        assert_eq!(state.peer_id(), "alice");
        assert_eq!(state.local_id(), "bob");
        state.role = Role::Initiator;
        assert_eq!(state.peer_id(), "bob");
    }

    #[test]
    fn lamport_observe_and_tick() {
        let mut state = established();
        assert_eq!(state.observe_lamport(3), 6);
        assert_eq!(state.observe_lamport(10), 11);
        assert_eq!(state.tick(), 12);
    }

    #[test]
    fn peer_lamport_must_advance() {
        let mut state = established();
        assert_eq!(state.accept_peer_lamport(2).unwrap(), 6);
        assert_eq!(state.peer_lamport, 2);

        assert!(matches!(
            state.accept_peer_lamport(2),
            Err(SitError::ReplayDetected { .. })
        ));
        assert!(state.check_peer_lamport(1).is_err());
        assert_eq!(state.lamport_clock, 6);

        assert_eq!(state.accept_peer_lamport(9).unwrap(), 10);
    }

    #[test]
    fn terminate_only_from_established() {
        let mut state = established();
        state.terminate("done").unwrap();
        assert_eq!(state.status, SessionStatus::Terminated);
        assert_eq!(state.termination_reason.as_deref(), Some("done"));

        assert!(matches!(
            state.terminate("again"),
            Err(SitError::UnexpectedIntentSource(_))
        ));
    }
}
