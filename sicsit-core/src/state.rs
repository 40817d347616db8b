//! Session state automaton.
//!
//! Status only moves forward: `INIT -> PENDING_SYN | PENDING_ACK ->
//! ESTABLISHED -> TERMINATED`, with `FAILED` reachable from any pending
//! state.

use serde::{Deserialize, Serialize};

use crate::error::{SitError, SitResult};

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// Nothing sent or received yet.
    Init,
    /// Initiator sent SYN, awaiting SYN-ACK.
    PendingSyn,
    /// Responder sent SYN-ACK, awaiting ACK.
    PendingAck,
    /// Handshake complete on this side.
    Established,
    /// Deadline passed or handshake aborted.
    Failed,
    /// Closed after establishment.
    Terminated,
}

impl SessionStatus {
    /// A failed or terminated session accepts no further events and can be
    /// reaped.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Terminated)
    }

    /// Waiting on the peer, with a handshake deadline armed.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::PendingSyn | Self::PendingAck)
    }

    /// Statuses a session may move to next. Pending sessions either complete
    /// or fail; only an established session can be terminated.
    pub fn valid_transitions(&self) -> &'static [SessionStatus] {
        match self {
            Self::Init => &[Self::PendingSyn, Self::PendingAck, Self::Failed],
            Self::PendingSyn => &[Self::Established, Self::Failed],
            Self::PendingAck => &[Self::Established, Self::Failed],
            Self::Established => &[Self::Terminated],
            Self::Failed => &[],
            Self::Terminated => &[],
        }
    }

    pub fn can_transition_to(&self, target: SessionStatus) -> bool {
        self.valid_transitions().contains(&target)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::PendingSyn => "PENDING_SYN",
            Self::PendingAck => "PENDING_ACK",
            Self::Established => "ESTABLISHED",
            Self::Failed => "FAILED",
            Self::Terminated => "TERMINATED",
        };
        f.write_str(name)
    }
}

/// Which side of the handshake the local entity played.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Initiator,
    Responder,
}

/// Events that drive session transitions.
#[derive(Debug, Clone)]
pub enum HandshakeEvent {
    /// Local SYN created and signed.
    SynSent,
    /// Peer SYN verified, SYN-ACK issued.
    SynAccepted,
    /// Peer SYN-ACK verified, ACK issued.
    SynAckAccepted,
    /// Peer ACK verified.
    AckAccepted,
    /// Pending deadline passed.
    DeadlineExpired,
    /// Handshake abandoned locally.
    Aborted(String),
    /// Established session closed.
    Terminated(String),
}

/// Resolve the status an event leads to, or reject it as out of order.
pub fn transition(current: SessionStatus, event: &HandshakeEvent) -> SitResult<SessionStatus> {
    use HandshakeEvent as E;
    use SessionStatus as S;

    let next = match (current, event) {
        (S::Init, E::SynSent) => S::PendingSyn,
        (S::Init, E::SynAccepted) => S::PendingAck,
        (S::PendingSyn, E::SynAckAccepted) => S::Established,
        (S::PendingAck, E::AckAccepted) => S::Established,
        (S::Init | S::PendingSyn | S::PendingAck, E::DeadlineExpired | E::Aborted(_)) => S::Failed,
        (S::Established, E::Terminated(_)) => S::Terminated,
        _ => {
            return Err(SitError::UnexpectedIntentSource(format!(
                "{:?} is not valid in state {}",
                event, current
            )))
        }
    };

    if current.can_transition_to(next) {
        tracing::debug!("Session transition: {} -> {}", current, next);
        Ok(next)
    } else {
        Err(SitError::UnexpectedIntentSource(format!(
            "invalid session transition: {} -> {}",
            current, next
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_status_transitions() {
        let state = SessionStatus::Init;
        assert!(state.can_transition_to(SessionStatus::PendingSyn));
        assert!(state.can_transition_to(SessionStatus::PendingAck));
        assert!(!state.can_transition_to(SessionStatus::Established));

        assert!(SessionStatus::PendingAck.can_transition_to(SessionStatus::Established));
        assert!(!SessionStatus::Established.can_transition_to(SessionStatus::PendingAck));
    }

    #[test]
    fn session_terminal_states() {
        assert!(SessionStatus::Failed.is_terminal());
        assert!(SessionStatus::Terminated.is_terminal());
        assert!(!SessionStatus::Established.is_terminal());
        assert!(SessionStatus::PendingSyn.is_pending());
    }

    #[test]
    fn handshake_event_transitions() {
        assert_eq!(
            transition(SessionStatus::Init, &HandshakeEvent::SynSent).unwrap(),
            SessionStatus::PendingSyn
        );
        assert_eq!(
            transition(SessionStatus::PendingSyn, &HandshakeEvent::SynAckAccepted).unwrap(),
            SessionStatus::Established
        );
        assert_eq!(
            transition(SessionStatus::PendingAck, &HandshakeEvent::DeadlineExpired).unwrap(),
            SessionStatus::Failed
        );
        assert_eq!(
            transition(
                SessionStatus::Established,
                &HandshakeEvent::Terminated("done".to_string())
            )
            .unwrap(),
            SessionStatus::Terminated
        );
    }

    #[test]
    fn out_of_order_events_are_rejected() {
        for (state, event) in [
            (SessionStatus::Init, HandshakeEvent::AckAccepted),
            (SessionStatus::PendingSyn, HandshakeEvent::AckAccepted),
            (SessionStatus::PendingAck, HandshakeEvent::SynAckAccepted),
            (SessionStatus::Established, HandshakeEvent::DeadlineExpired),
            (SessionStatus::Failed, HandshakeEvent::SynSent),
            (SessionStatus::Terminated, HandshakeEvent::Terminated(String::new())),
        ] {
            assert!(matches!(
                transition(state, &event),
                Err(SitError::UnexpectedIntentSource(_))
            ));
        }
    }

    #[test]
    fn status_serde_names() {
        assert_eq!(
            serde_json::to_string(&SessionStatus::PendingAck).unwrap(),
            "\"PENDING_ACK\""
        );
        assert_eq!(SessionStatus::Established.to_string(), "ESTABLISHED");
    }
}
