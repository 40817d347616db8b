//! Handshake state machine.
//!
//! Drives one session through SYN -> SYN-ACK -> ACK. Every step works on a
//! copy of the session and commits only when all checks pass, so a rejected
//! message never leaves partial state behind. Only a passed deadline (or an
//! explicit abort) moves a pending session to `FAILED`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::canonical::{timestamp_now, timestamp_text, Digest};
use crate::error::{SitError, SitResult};
use crate::ledger::NonceLedger;
use crate::message::{
    derive_session_id, fresh_nonce, Ack, HandshakeMessage, SemanticBoundary, Syn, SynAck,
};
use crate::session::SitState;
use crate::signature::{Identity, KeyDirectory, KeyRing, SignatureChain, SignedEntry};
use crate::state::{transition, HandshakeEvent, Role, SessionStatus};

/// Default time a pending session waits for the next message.
pub const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(30);

/// Default tolerated distance between a message timestamp and local time.
pub const DEFAULT_MAX_CLOCK_SKEW_MS: i64 = 30_000;

/// Handshake timing parameters.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeConfig {
    pub pending_timeout: Duration,
    pub max_clock_skew_ms: i64,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            pending_timeout: DEFAULT_PENDING_TIMEOUT,
            max_clock_skew_ms: DEFAULT_MAX_CLOCK_SKEW_MS,
        }
    }
}

/// Everything a machine needs that is shared across the node's sessions.
#[derive(Debug)]
pub struct HandshakeContext {
    pub identity: Identity,
    pub keys: Arc<KeyRing>,
    pub ledger: Arc<NonceLedger>,
    pub config: HandshakeConfig,
}

impl HandshakeContext {
    /// Build a context; the local identity's key is registered in `keys`.
    pub fn new(
        identity: Identity,
        keys: Arc<KeyRing>,
        ledger: Arc<NonceLedger>,
        config: HandshakeConfig,
    ) -> Self {
        keys.register(identity.entity_id(), identity.verifying_key());
        Self {
            identity,
            keys,
            ledger,
            config,
        }
    }

    pub fn entity_id(&self) -> &str {
        self.identity.entity_id()
    }

    fn peer_key(&self, entity_id: &str) -> SitResult<ed25519_dalek::VerifyingKey> {
        self.keys
            .public_key(entity_id)
            .ok_or_else(|| SitError::UnknownPeer(entity_id.to_string()))
    }

    fn check_fresh<M: HandshakeMessage>(&self, message: &M) -> SitResult<()> {
        let skew = Utc::now().signed_duration_since(message.timestamp());
        if skew.num_milliseconds().abs() > self.config.max_clock_skew_ms {
            return Err(SitError::Expired {
                created_at: timestamp_text(&message.timestamp()),
                window_ms: self.config.max_clock_skew_ms,
            });
        }
        Ok(())
    }

    /// Sender key, signature, then freshness.
    fn authenticate<M: HandshakeMessage>(&self, message: &M) -> SitResult<()> {
        let key = self.peer_key(message.entity_id())?;
        message.verify_with(&key)?;
        self.check_fresh(message)
    }
}

#[derive(Debug, Clone)]
struct Pending {
    own_nonce: String,
    /// Initiator's nonce, known to the responder from the SYN.
    peer_nonce: Option<String>,
    peer_id: String,
    deadline: Instant,
}

/// Per-session handshake driver.
#[derive(Debug)]
pub struct HandshakeMachine {
    ctx: Arc<HandshakeContext>,
    state: Option<SitState>,
    pending: Option<Pending>,
}

impl HandshakeMachine {
    pub fn new(ctx: Arc<HandshakeContext>) -> Self {
        Self {
            ctx,
            state: None,
            pending: None,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.state
            .as_ref()
            .map(|s| s.status)
            .unwrap_or(SessionStatus::Init)
    }

    pub fn session(&self) -> Option<&SitState> {
        self.state.as_ref()
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.state.as_ref().map(|s| s.session_id)
    }

    /// Deadline of the pending step, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.deadline)
    }

    /// Open a handshake towards `peer`.
    pub fn create_syn(
        &mut self,
        peer: &str,
        intent_scope: impl Into<String>,
        semantic_boundary: SemanticBoundary,
    ) -> SitResult<Syn> {
        let status = transition(self.status(), &HandshakeEvent::SynSent)?;
        let local = self.ctx.entity_id().to_string();
        if peer == local {
            return Err(SitError::UnexpectedIntentSource(
                "cannot open a session with self".to_string(),
            ));
        }
        self.ctx.peer_key(peer)?;

        let syn = Syn {
            entity_id: local.clone(),
            nonce: fresh_nonce(),
            intent_scope: intent_scope.into(),
            semantic_boundary,
            timestamp: timestamp_now(),
            signature: String::new(),
        }
        .sign_with(&self.ctx.identity)?;

        let mut signature_chain = SignatureChain::new();
        self.record(&mut signature_chain, &syn.message_digest()?)?;

        let state = SitState {
            session_id: derive_session_id(&local, &syn.nonce),
            role: Role::Initiator,
            entity_a: local,
            entity_b: peer.to_string(),
            intent_scope: syn.intent_scope.clone(),
            semantic_boundary: syn.semantic_boundary.clone(),
            lamport_clock: 0,
            peer_lamport: 0,
            signature_chain,
            status,
            established_at: None,
            novelty: None,
            termination_reason: None,
        };

        self.commit(
            state,
            Some(Pending {
                own_nonce: syn.nonce.clone(),
                peer_nonce: None,
                peer_id: peer.to_string(),
                deadline: Instant::now() + self.ctx.config.pending_timeout,
            }),
        );
        Ok(syn)
    }

    /// Accept a peer's SYN and answer with a SYN-ACK.
    pub fn process_syn(&mut self, syn: &Syn) -> SitResult<SynAck> {
        let status = transition(self.status(), &HandshakeEvent::SynAccepted)?;
        let local = self.ctx.entity_id().to_string();
        if syn.entity_id == local {
            return Err(SitError::UnexpectedIntentSource(
                "SYN claims to come from the local entity".to_string(),
            ));
        }

        self.ctx.authenticate(syn)?;
        // Only an authentic SYN may occupy a ledger slot.
        self.ctx.ledger.consume(&syn.entity_id, &syn.nonce)?;

        let syn_ack = SynAck {
            entity_id: local.clone(),
            nonce: fresh_nonce(),
            ack_nonce: syn.nonce.clone(),
            intent_scope: syn.intent_scope.clone(),
            semantic_boundary: syn.semantic_boundary.clone(),
            timestamp: timestamp_now(),
            signature: String::new(),
        }
        .sign_with(&self.ctx.identity)?;

        let mut signature_chain = SignatureChain::new();
        self.record(&mut signature_chain, &syn.message_digest()?)?;
        self.record(&mut signature_chain, &syn_ack.message_digest()?)?;

        let state = SitState {
            session_id: derive_session_id(&syn.entity_id, &syn.nonce),
            role: Role::Responder,
            entity_a: syn.entity_id.clone(),
            entity_b: local,
            intent_scope: syn.intent_scope.clone(),
            semantic_boundary: syn.semantic_boundary.clone(),
            lamport_clock: 0,
            peer_lamport: 0,
            signature_chain,
            status,
            established_at: None,
            novelty: None,
            termination_reason: None,
        };

        self.commit(
            state,
            Some(Pending {
                own_nonce: syn_ack.nonce.clone(),
                peer_nonce: Some(syn.nonce.clone()),
                peer_id: syn.entity_id.clone(),
                deadline: Instant::now() + self.ctx.config.pending_timeout,
            }),
        );
        Ok(syn_ack)
    }

    /// Accept the responder's SYN-ACK and confirm with an ACK.
    pub fn process_syn_ack(&mut self, syn_ack: &SynAck, lamport: u64) -> SitResult<Ack> {
        let status = transition(self.status(), &HandshakeEvent::SynAckAccepted)?;
        let (mut state, pending) = self.pending_step(syn_ack)?;

        if syn_ack.ack_nonce != pending.own_nonce {
            return Err(SitError::NonceMismatch {
                expected: pending.own_nonce,
                got: syn_ack.ack_nonce.clone(),
            });
        }
        check_scope(&state, syn_ack)?;
        self.ctx.ledger.consume(&syn_ack.entity_id, &syn_ack.nonce)?;

        let ack = Ack {
            entity_id: self.ctx.entity_id().to_string(),
            nonce: pending.own_nonce.clone(),
            ack_nonce: syn_ack.nonce.clone(),
            intent_scope: state.intent_scope.clone(),
            semantic_boundary: state.semantic_boundary.clone(),
            timestamp: timestamp_now(),
            signature: String::new(),
        }
        .sign_with(&self.ctx.identity)?;

        self.record(&mut state.signature_chain, &syn_ack.message_digest()?)?;
        self.record(&mut state.signature_chain, &ack.message_digest()?)?;
        self.establish(&mut state, status, lamport);

        self.commit(state, None);
        Ok(ack)
    }

    /// Accept the initiator's ACK and finalize the session.
    pub fn process_ack(&mut self, ack: &Ack, lamport: u64) -> SitResult<SitState> {
        let status = transition(self.status(), &HandshakeEvent::AckAccepted)?;
        let (mut state, pending) = self.pending_step(ack)?;

        let initiator_nonce = pending.peer_nonce.clone().unwrap_or_default();
        if ack.nonce != initiator_nonce {
            return Err(SitError::NonceMismatch {
                expected: initiator_nonce,
                got: ack.nonce.clone(),
            });
        }
        if ack.ack_nonce != pending.own_nonce {
            return Err(SitError::NonceMismatch {
                expected: pending.own_nonce,
                got: ack.ack_nonce.clone(),
            });
        }
        check_scope(&state, ack)?;

        self.record(&mut state.signature_chain, &ack.message_digest()?)?;
        self.establish(&mut state, status, lamport);

        self.commit(state.clone(), None);
        Ok(state)
    }

    /// Fail a pending session whose deadline has passed. Its nonces are
    /// burned so nothing from it can be replayed later.
    pub fn expire(&mut self, now: Instant) -> bool {
        let due = self.pending.as_ref().is_some_and(|p| now >= p.deadline);
        if !due {
            return false;
        }
        self.fail(HandshakeEvent::DeadlineExpired)
    }

    /// Abandon a handshake that has not completed.
    pub fn abort(&mut self, reason: impl Into<String>) -> bool {
        self.fail(HandshakeEvent::Aborted(reason.into()))
    }

    /// Merge a peer's lamport timestamp into an established session.
    pub fn observe_lamport(&mut self, remote: u64) -> SitResult<u64> {
        Ok(self.established_mut()?.observe_lamport(remote))
    }

    /// Merge the timestamp of a peer exchange, refusing any that does not
    /// advance past the last one accepted.
    pub fn accept_peer_lamport(&mut self, remote: u64) -> SitResult<u64> {
        self.established_mut()?.accept_peer_lamport(remote)
    }

    /// Advance the lamport clock for a local event.
    pub fn tick_lamport(&mut self) -> SitResult<u64> {
        Ok(self.established_mut()?.tick())
    }

    /// Record an exchanged payload in the signature chain.
    pub fn record_exchange(&mut self, payload_digest: &Digest) -> SitResult<SignedEntry> {
        let ctx = Arc::clone(&self.ctx);
        let state = self.established_mut()?;
        state
            .signature_chain
            .append_entry(&ctx.identity, payload_digest, ctx.keys.as_ref())
    }

    pub fn set_novelty(&mut self, novelty: Option<f64>) -> SitResult<()> {
        self.established_mut()?.novelty = novelty;
        Ok(())
    }

    /// Close an established session.
    pub fn terminate(&mut self, reason: impl Into<String>) -> SitResult<()> {
        let reason = reason.into();
        match self.state.as_mut() {
            Some(state) => {
                state.terminate(reason.clone())?;
                tracing::info!(session_id = %state.session_id, %reason, "Session terminated");
                Ok(())
            }
            None => Err(SitError::UnexpectedIntentSource(
                "no session to terminate".to_string(),
            )),
        }
    }

    /// Shared checks for the two steps that answer a pending session:
    /// deadline, bound peer, signature and freshness.
    fn pending_step<M: HandshakeMessage>(&mut self, message: &M) -> SitResult<(SitState, Pending)> {
        let (state, pending) = match (self.state.as_ref(), self.pending.as_ref()) {
            (Some(state), Some(pending)) => (state.clone(), pending.clone()),
            _ => {
                return Err(SitError::UnexpectedIntentSource(
                    "no pending handshake".to_string(),
                ))
            }
        };

        if Instant::now() >= pending.deadline {
            self.fail(HandshakeEvent::DeadlineExpired);
            return Err(SitError::DeadlineExpired(state.session_id));
        }
        if message.entity_id() != pending.peer_id {
            return Err(SitError::UnexpectedIntentSource(format!(
                "expected {} from {}, got it from {}",
                M::KIND,
                pending.peer_id,
                message.entity_id()
            )));
        }
        self.ctx.authenticate(message)?;

        Ok((state, pending))
    }

    fn record(&self, chain: &mut SignatureChain, digest: &Digest) -> SitResult<SignedEntry> {
        chain.append_entry(&self.ctx.identity, digest, self.ctx.keys.as_ref())
    }

    fn establish(&self, state: &mut SitState, status: SessionStatus, lamport: u64) {
        state.status = status;
        state.established_at = Some(Utc::now());
        state.lamport_clock = lamport;
        tracing::info!(
            session_id = %state.session_id,
            peer = %state.peer_id(),
            scope = %state.intent_scope,
            "Session established"
        );
    }

    fn commit(&mut self, state: SitState, pending: Option<Pending>) {
        self.state = Some(state);
        self.pending = pending;
    }

    fn fail(&mut self, event: HandshakeEvent) -> bool {
        let Some(state) = self.state.as_mut() else {
            return false;
        };
        if state.apply(&event).is_err() {
            return false;
        }
        if let Some(pending) = self.pending.take() {
            self.ctx.ledger.burn(self.ctx.entity_id(), &pending.own_nonce);
            if let Some(peer_nonce) = pending.peer_nonce {
                self.ctx.ledger.burn(&pending.peer_id, &peer_nonce);
            }
        }
        tracing::warn!(session_id = %state.session_id, event = ?event, "Handshake failed");
        true
    }

    fn established_mut(&mut self) -> SitResult<&mut SitState> {
        match self.state.as_mut() {
            Some(state) if state.is_established() => Ok(state),
            Some(state) => Err(SitError::NotEstablished(state.session_id)),
            None => Err(SitError::UnexpectedIntentSource(
                "no session on this machine".to_string(),
            )),
        }
    }
}

fn check_scope<M: HandshakeMessage>(state: &SitState, message: &M) -> SitResult<()> {
    if message.intent_scope() != state.intent_scope {
        return Err(SitError::ScopeMismatch(format!(
            "intent_scope {} != {}",
            message.intent_scope(),
            state.intent_scope
        )));
    }
    if message.semantic_boundary() != &state.semantic_boundary {
        return Err(SitError::ScopeMismatch(
            "semantic_boundary differs from the proposal".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::sha256;

    struct Pair {
        alice: HandshakeMachine,
        bob: HandshakeMachine,
        keys: Arc<KeyRing>,
    }

    fn context(name: &str, keys: &Arc<KeyRing>, config: HandshakeConfig) -> Arc<HandshakeContext> {
        Arc::new(HandshakeContext::new(
            Identity::generate(name),
            Arc::clone(keys),
            Arc::new(NonceLedger::default()),
            config,
        ))
    }

    fn pair_with(config: HandshakeConfig) -> Pair {
        let keys = Arc::new(KeyRing::new());
        Pair {
            alice: HandshakeMachine::new(context("alice", &keys, config)),
            bob: HandshakeMachine::new(context("bob", &keys, config)),
            keys,
        }
    }

    fn pair() -> Pair {
        pair_with(HandshakeConfig::default())
    }

    fn boundary() -> SemanticBoundary {
        ["invoices", "payments"].iter().map(|s| s.to_string()).collect()
    }

    fn establish(p: &mut Pair) -> (Syn, SynAck, Ack) {
        let syn = p.alice.create_syn("bob", "billing.read", boundary()).unwrap();
        let syn_ack = p.bob.process_syn(&syn).unwrap();
        let ack = p.alice.process_syn_ack(&syn_ack, 7).unwrap();
        p.bob.process_ack(&ack, 9).unwrap();
        (syn, syn_ack, ack)
    }

    #[tokio::test]
    async fn full_handshake_establishes_both_sides() {
        let mut p = pair();
        establish(&mut p);

        let a = p.alice.session().unwrap();
        let b = p.bob.session().unwrap();
        assert_eq!(a.status, SessionStatus::Established);
        assert_eq!(b.status, SessionStatus::Established);
        assert_eq!(a.session_id, b.session_id);
        assert_eq!((a.entity_a.as_str(), a.entity_b.as_str()), ("alice", "bob"));
        assert_eq!((b.entity_a.as_str(), b.entity_b.as_str()), ("alice", "bob"));
        assert_eq!(a.intent_scope, b.intent_scope);
        assert_eq!(a.semantic_boundary, b.semantic_boundary);
        assert_eq!(a.lamport_clock, 7);
        assert_eq!(b.lamport_clock, 9);

        assert_eq!(a.signature_chain.len(), 3);
        assert_eq!(b.signature_chain.len(), 3);
        assert!(a.signature_chain.verify_chain(p.keys.as_ref()));
        assert!(b.signature_chain.verify_chain(p.keys.as_ref()));
        for (ea, eb) in a
            .signature_chain
            .entries()
            .iter()
            .zip(b.signature_chain.entries())
        {
            assert_eq!(ea.payload_digest, eb.payload_digest);
        }
        assert!(p.alice.deadline().is_none());
    }

    #[tokio::test]
    async fn replayed_syn_is_rejected() {
        let keys = Arc::new(KeyRing::new());
        let ledger = Arc::new(NonceLedger::default());
        let alice_ctx = context("alice", &keys, HandshakeConfig::default());
        let bob_ctx = Arc::new(HandshakeContext::new(
            Identity::generate("bob"),
            Arc::clone(&keys),
            Arc::clone(&ledger),
            HandshakeConfig::default(),
        ));

        let mut alice = HandshakeMachine::new(alice_ctx);
        let syn = alice.create_syn("bob", "billing.read", boundary()).unwrap();

        let mut first = HandshakeMachine::new(Arc::clone(&bob_ctx));
        first.process_syn(&syn).unwrap();

        let mut second = HandshakeMachine::new(bob_ctx);
        assert!(matches!(
            second.process_syn(&syn),
            Err(SitError::ReplayDetected { .. })
        ));
        assert_eq!(second.status(), SessionStatus::Init);
        assert!(second.session().is_none());
    }

    #[tokio::test]
    async fn ack_before_syn_ack_is_unexpected() {
        let mut p = pair();
        let syn = p.alice.create_syn("bob", "billing.read", boundary()).unwrap();
        let forged = Ack {
            entity_id: "alice".to_string(),
            nonce: syn.nonce.clone(),
            ack_nonce: fresh_nonce(),
            intent_scope: syn.intent_scope.clone(),
            semantic_boundary: syn.semantic_boundary.clone(),
            timestamp: timestamp_now(),
            signature: String::new(),
        };

        // Responder that never issued a SYN-ACK.
        let before = p.bob.status();
        assert!(matches!(
            p.bob.process_ack(&forged, 0),
            Err(SitError::UnexpectedIntentSource(_))
        ));
        assert_eq!(p.bob.status(), before);

        // Initiator waiting for SYN-ACK.
        let snapshot = p.alice.session().cloned();
        assert!(matches!(
            p.alice.process_ack(&forged, 0),
            Err(SitError::UnexpectedIntentSource(_))
        ));
        assert_eq!(p.alice.session().cloned(), snapshot);
    }

    #[tokio::test]
    async fn second_syn_on_same_machine_is_unexpected() {
        let mut p = pair();
        let syn = p.alice.create_syn("bob", "billing.read", boundary()).unwrap();
        p.bob.process_syn(&syn).unwrap();
        assert!(matches!(
            p.bob.process_syn(&syn),
            Err(SitError::UnexpectedIntentSource(_))
        ));
        assert!(matches!(
            p.alice.create_syn("bob", "billing.read", boundary()),
            Err(SitError::UnexpectedIntentSource(_))
        ));
    }

    #[tokio::test]
    async fn forged_syn_signature_is_rejected_without_consuming_nonce() {
        let mut p = pair();
        let mut syn = p.alice.create_syn("bob", "billing.read", boundary()).unwrap();
        let genuine = syn.clone();
        syn.intent_scope = "payroll.write".to_string();

        assert!(matches!(
            p.bob.process_syn(&syn),
            Err(SitError::SignatureInvalid)
        ));
        assert_eq!(p.bob.status(), SessionStatus::Init);
        // The forged attempt did not burn the genuine nonce.
        assert!(p.bob.process_syn(&genuine).is_ok());
    }

    #[tokio::test]
    async fn unknown_peer_and_self_handshake_are_rejected() {
        let mut p = pair();
        assert!(matches!(
            p.alice.create_syn("carol", "billing.read", boundary()),
            Err(SitError::UnknownPeer(_))
        ));
        assert!(matches!(
            p.alice.create_syn("alice", "billing.read", boundary()),
            Err(SitError::UnexpectedIntentSource(_))
        ));
        assert_eq!(p.alice.status(), SessionStatus::Init);

        let carol = Identity::generate("carol");
        let syn = Syn {
            entity_id: "carol".to_string(),
            nonce: fresh_nonce(),
            intent_scope: "billing.read".to_string(),
            semantic_boundary: boundary(),
            timestamp: timestamp_now(),
            signature: String::new(),
        }
        .sign_with(&carol)
        .unwrap();
        assert!(matches!(
            p.bob.process_syn(&syn),
            Err(SitError::UnknownPeer(_))
        ));
    }

    #[tokio::test]
    async fn stale_syn_is_expired() {
        let mut p = pair();
        let alice_identity = Identity::generate("alice");
        p.keys.register("alice", alice_identity.verifying_key());
        let syn = Syn {
            entity_id: "alice".to_string(),
            nonce: fresh_nonce(),
            intent_scope: "billing.read".to_string(),
            semantic_boundary: boundary(),
            timestamp: timestamp_now() - chrono::Duration::minutes(5),
            signature: String::new(),
        }
        .sign_with(&alice_identity)
        .unwrap();

        assert!(matches!(
            p.bob.process_syn(&syn),
            Err(SitError::Expired { .. })
        ));
    }

    #[tokio::test]
    async fn wrong_echoed_nonce_is_mismatch() {
        let mut p = pair();
        let syn = p.alice.create_syn("bob", "billing.read", boundary()).unwrap();

        // A correctly signed SYN-ACK echoing a nonce alice never sent.
        let mut syn_ack = p.bob.process_syn(&syn).unwrap();
        syn_ack.ack_nonce = fresh_nonce();
        let syn_ack = syn_ack.sign_with(&p.bob.ctx.identity).unwrap();

        let snapshot = p.alice.session().cloned();
        assert!(matches!(
            p.alice.process_syn_ack(&syn_ack, 1),
            Err(SitError::NonceMismatch { .. })
        ));
        assert_eq!(p.alice.session().cloned(), snapshot);
        assert_eq!(p.alice.status(), SessionStatus::PendingSyn);
    }

    #[tokio::test]
    async fn narrowed_scope_is_rejected() {
        let mut p = pair();
        let syn = p.alice.create_syn("bob", "billing.read", boundary()).unwrap();
        let mut syn_ack = p.bob.process_syn(&syn).unwrap();
        syn_ack.semantic_boundary.remove("payments");
        let syn_ack = syn_ack.sign_with(&p.bob.ctx.identity).unwrap();

        assert!(matches!(
            p.alice.process_syn_ack(&syn_ack, 1),
            Err(SitError::ScopeMismatch(_))
        ));
        assert_eq!(p.alice.status(), SessionStatus::PendingSyn);
    }

    #[tokio::test]
    async fn syn_ack_from_wrong_sender_is_unexpected() {
        let mut p = pair();
        let carol_ctx = context("carol", &p.keys, HandshakeConfig::default());
        let mut carol = HandshakeMachine::new(carol_ctx);

        let syn = p.alice.create_syn("bob", "billing.read", boundary()).unwrap();
        let syn_ack = carol.process_syn(&syn).unwrap();
        assert!(matches!(
            p.alice.process_syn_ack(&syn_ack, 1),
            Err(SitError::UnexpectedIntentSource(_))
        ));
    }

    #[tokio::test]
    async fn expired_pending_session_fails_and_burns_nonces() {
        let config = HandshakeConfig {
            pending_timeout: Duration::from_secs(5),
            ..HandshakeConfig::default()
        };
        let mut p = pair_with(config);
        let syn = p.alice.create_syn("bob", "billing.read", boundary()).unwrap();
        let syn_ack = p.bob.process_syn(&syn).unwrap();

        let deadline = p.bob.deadline().unwrap();
        assert!(!p.bob.expire(deadline - Duration::from_millis(1)));
        assert!(p.bob.expire(deadline));
        assert_eq!(p.bob.status(), SessionStatus::Failed);
        assert!(p.bob.ctx.ledger.contains("bob", &syn_ack.nonce));
        assert!(p.bob.ctx.ledger.contains("alice", &syn.nonce));

        let ack = p.alice.process_syn_ack(&syn_ack, 1).unwrap();
        assert!(matches!(
            p.bob.process_ack(&ack, 1),
            Err(SitError::UnexpectedIntentSource(_))
        ));
        assert!(!p.bob.expire(deadline + Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn late_message_fails_the_session() {
        let config = HandshakeConfig {
            pending_timeout: Duration::ZERO,
            ..HandshakeConfig::default()
        };
        let mut p = pair_with(config);
        let syn = p.alice.create_syn("bob", "billing.read", boundary()).unwrap();
        let syn_ack = p.bob.process_syn(&syn).unwrap();

        assert!(matches!(
            p.alice.process_syn_ack(&syn_ack, 1),
            Err(SitError::DeadlineExpired(_))
        ));
        assert_eq!(p.alice.status(), SessionStatus::Failed);
    }

    #[tokio::test]
    async fn established_session_operations() {
        let mut p = pair();
        establish(&mut p);

        assert_eq!(p.alice.tick_lamport().unwrap(), 8);
        assert_eq!(p.bob.observe_lamport(8).unwrap(), 10);

        let entry = p.alice.record_exchange(&sha256(b"payload")).unwrap();
        assert_eq!(entry.sequence_no, 3);
        assert_eq!(entry.signer_id, "alice");
        assert!(p
            .alice
            .session()
            .unwrap()
            .signature_chain
            .verify_chain(p.keys.as_ref()));

        p.alice.terminate("done").unwrap();
        assert_eq!(p.alice.status(), SessionStatus::Terminated);
        assert!(matches!(
            p.alice.tick_lamport(),
            Err(SitError::NotEstablished(_))
        ));
        assert!(!p.alice.abort("late"));
    }

    #[tokio::test]
    async fn pending_session_rejects_exchange_operations() {
        let mut p = pair();
        p.alice.create_syn("bob", "billing.read", boundary()).unwrap();
        assert!(matches!(
            p.alice.record_exchange(&sha256(b"x")),
            Err(SitError::NotEstablished(_))
        ));
        assert!(p.alice.abort("operator cancelled"));
        assert_eq!(p.alice.status(), SessionStatus::Failed);
    }
}
