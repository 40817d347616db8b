//! Packet handling for a SIC-SIT node.
//!
//! Inbound packets pass through the codec, the destination check and the
//! firewall before the frame is decoded and dispatched to its session.

use std::sync::Arc;

use serde_json::{Map, Value};
use uuid::Uuid;

use sicsit_core::{
    derive_session_id, digest_value, CategoryScorer, DriftDetector, DriftResult, DriftScorer,
    Firewall, GovernanceAction, GovernanceTable, HandshakeContext, HandshakeMachine, Identity,
    KeyRing, NonceLedger, Packet, PacketCodec, Policy, SemanticBoundary, Services, SitError,
    SitResult, SitState, Violation,
};

use crate::config::NodeConfig;
use crate::frame::{intent_view, Frame};
use crate::registry::{SessionRegistry, SharedMachine};

/// What became of an inbound packet.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// A handshake step that must be answered with this packet.
    Reply(Packet),
    /// The responder side of a session reached ESTABLISHED.
    Established(Uuid),
    Exchange(ExchangeOutcome),
}

/// Result of an exchange on an established session.
#[derive(Debug, Clone)]
pub enum ExchangeOutcome {
    Accepted {
        session_id: Uuid,
        lamport: u64,
        novelty: Option<f64>,
        body: Map<String, Value>,
    },
    /// The body strayed outside the session boundary.
    Drifted {
        session_id: Uuid,
        drift: DriftResult,
        action: GovernanceAction,
        terminated: bool,
        body: Map<String, Value>,
    },
}

/// SIC-SIT node.
pub struct Node {
    config: NodeConfig,
    ctx: Arc<HandshakeContext>,
    codec: PacketCodec,
    firewall: Firewall,
    drift: DriftDetector,
    governance: GovernanceTable,
    services: Services,
    registry: SessionRegistry,
}

impl Node {
    /// Create a new node.
    ///
    /// `keys` is the directory of known peers; the node's own key is added to it.
    pub fn new(
        config: NodeConfig,
        identity: Identity,
        keys: Arc<KeyRing>,
        policy: &Policy,
    ) -> SitResult<Self> {
        config.validate()?;
        if identity.entity_id() != config.entity_id {
            return Err(SitError::Config(format!(
                "identity {} does not match configured entity {}",
                identity.entity_id(),
                config.entity_id
            )));
        }

        let ledger = Arc::new(NonceLedger::new(config.nonce_window(), config.nonce_capacity));
        let ctx = Arc::new(HandshakeContext::new(
            identity,
            keys,
            ledger,
            config.handshake_config(),
        ));
        let firewall = Firewall::new(policy)?;
        let drift = DriftDetector::new(Arc::new(CategoryScorer::default()), config.drift_threshold);
        let services = Services::local_only().with_policy(config.service_policy());

        tracing::info!(
            entity_id = %config.entity_id,
            policy = firewall.policy_version(),
            "Node initialized"
        );

        Ok(Self {
            codec: config.codec(),
            config,
            ctx,
            firewall,
            drift,
            governance: GovernanceTable::new(),
            services,
            registry: SessionRegistry::new(),
        })
    }

    pub fn with_services(mut self, services: Services) -> Self {
        self.services = services.with_policy(self.config.service_policy());
        self
    }

    pub fn with_drift_scorer(mut self, scorer: Arc<dyn DriftScorer>) -> Self {
        self.drift = DriftDetector::new(scorer, self.config.drift_threshold);
        self
    }

    pub fn with_governance(mut self, governance: GovernanceTable) -> Self {
        self.governance = governance;
        self
    }

    pub fn entity_id(&self) -> &str {
        self.ctx.entity_id()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn codec(&self) -> &PacketCodec {
        &self.codec
    }

    /// Open a session towards `peer`, returning the SYN packet to deliver.
    pub async fn initiate(
        &self,
        peer: &str,
        intent_scope: &str,
        semantic_boundary: SemanticBoundary,
    ) -> SitResult<Packet> {
        let mut machine = HandshakeMachine::new(Arc::clone(&self.ctx));
        let syn = machine.create_syn(peer, intent_scope, semantic_boundary)?;
        let session_id = derive_session_id(&syn.entity_id, &syn.nonce);
        let deadline = machine.deadline();

        let shared = self.registry.insert(session_id, machine).await?;
        if let Some(deadline) = deadline {
            self.registry.arm_deadline(session_id, shared, deadline);
        }

        tracing::debug!(%session_id, peer, intent_scope, "SYN sent");
        self.frame_packet(&Frame::Syn(syn), peer)
    }

    /// Decode and handle raw packet bytes.
    pub async fn handle_bytes(&self, bytes: &[u8]) -> SitResult<Inbound> {
        let packet = self
            .codec
            .decode(bytes)
            .map_err(|e| self.rejected("<undecoded>", e))?;
        self.handle_packet(&packet).await
    }

    /// Handle one inbound packet.
    pub async fn handle_packet(&self, packet: &Packet) -> SitResult<Inbound> {
        self.dispatch(packet)
            .await
            .map_err(|e| self.rejected(&packet.src_model, e))
    }

    /// Log a rejection with the governance action it maps to.
    fn rejected(&self, src: &str, e: SitError) -> SitError {
        let action = Violation::from_error(&e).map(|v| self.governance.resolve(v));
        tracing::warn!(code = e.code(), action = ?action, src, "Packet rejected: {}", e);
        e
    }

    /// Send an application body on an established session.
    ///
    /// The body is checked for drift locally first; a drifting body is never sent.
    pub async fn send(&self, session_id: Uuid, body: Value) -> SitResult<Packet> {
        let Value::Object(body) = body else {
            return Err(SitError::MalformedPayload(
                "exchange body must be a structured map".to_string(),
            ));
        };
        let machine = self.machine(&session_id).await?;
        let mut machine = machine.lock().await;

        let session = machine.session().ok_or(SitError::UnknownSession(session_id))?;
        let peer = session.peer_id().to_string();
        self.drift.check(session, &body)?.into_result()?;

        let lamport = machine.tick_lamport()?;
        machine.record_exchange(&digest_value(&Value::Object(body.clone())))?;
        drop(machine);

        let frame = Frame::Exchange {
            session_id,
            lamport,
            body,
        };
        self.frame_packet(&frame, &peer)
    }

    /// Close an established session.
    pub async fn terminate(&self, session_id: Uuid, reason: &str) -> SitResult<()> {
        let machine = self.machine(&session_id).await?;
        machine.lock().await.terminate(reason)?;
        self.registry.disarm(&session_id);
        Ok(())
    }

    /// Snapshot of a session.
    pub async fn session(&self, session_id: &Uuid) -> Option<SitState> {
        let machine = self.registry.get(session_id).await?;
        let machine = machine.lock().await;
        machine.session().cloned()
    }

    /// Drop failed and terminated sessions.
    pub async fn reap(&self) -> usize {
        self.registry.reap().await
    }

    async fn dispatch(&self, packet: &Packet) -> SitResult<Inbound> {
        self.codec.validate_packet(packet)?;
        if packet.dst_model != self.entity_id() {
            return Err(SitError::Misdirected {
                dst: packet.dst_model.clone(),
                local: self.entity_id().to_string(),
            });
        }
        let verdict = self.firewall.evaluate(intent_view(&packet.payload));
        tracing::debug!(
            src = %packet.src_model,
            policy = %verdict.policy_version,
            checks = verdict.audit.len(),
            action = ?verdict.action,
            "Firewall evaluated"
        );
        verdict.into_result()?;

        let frame = Frame::from_payload(&packet.payload)?;
        if let Some(claimed) = frame.claimed_sender() {
            if claimed != packet.src_model {
                return Err(SitError::UnexpectedIntentSource(format!(
                    "{} frame claims sender {} but arrived from {}",
                    frame.kind(),
                    claimed,
                    packet.src_model
                )));
            }
        }

        match frame {
            Frame::Syn(syn) => {
                let mut machine = HandshakeMachine::new(Arc::clone(&self.ctx));
                let syn_ack = machine.process_syn(&syn)?;
                let session_id = derive_session_id(&syn.entity_id, &syn.nonce);
                let deadline = machine.deadline();

                let shared = self.registry.insert(session_id, machine).await?;
                if let Some(deadline) = deadline {
                    self.registry.arm_deadline(session_id, shared, deadline);
                }
                tracing::debug!(%session_id, peer = %syn.entity_id, "SYN accepted");
                Ok(Inbound::Reply(self.frame_packet(&Frame::SynAck(syn_ack), &syn.entity_id)?))
            }
            Frame::SynAck(syn_ack) => {
                let session_id = derive_session_id(self.entity_id(), &syn_ack.ack_nonce);
                let machine = self.pending_machine(&session_id, "SYN_ACK").await?;
                let lamport = self.services.tick().await.value;

                let ack = machine.lock().await.process_syn_ack(&syn_ack, lamport)?;
                self.registry.disarm(&session_id);
                Ok(Inbound::Reply(self.frame_packet(&Frame::Ack(ack), &syn_ack.entity_id)?))
            }
            Frame::Ack(ack) => {
                let session_id = derive_session_id(&ack.entity_id, &ack.nonce);
                let machine = self.pending_machine(&session_id, "ACK").await?;
                let lamport = self.services.tick().await.value;

                machine.lock().await.process_ack(&ack, lamport)?;
                self.registry.disarm(&session_id);
                Ok(Inbound::Established(session_id))
            }
            Frame::Exchange {
                session_id,
                lamport,
                body,
            } => self.on_exchange(packet, session_id, lamport, body).await,
        }
    }

    async fn on_exchange(
        &self,
        packet: &Packet,
        session_id: Uuid,
        lamport: u64,
        body: Map<String, Value>,
    ) -> SitResult<Inbound> {
        let machine = self.machine(&session_id).await?;

        let drift = {
            let machine = machine.lock().await;
            let session = machine.session().ok_or(SitError::UnknownSession(session_id))?;
            if session.peer_id() != packet.src_model {
                return Err(SitError::UnexpectedIntentSource(format!(
                    "session {} is not bound to {}",
                    session_id, packet.src_model
                )));
            }
            session.check_peer_lamport(lamport)?;
            self.drift.check(session, &body)?
        };

        if drift.drifted {
            let action = self.governance.resolve(Violation::SemanticInconsistency);
            let outcome = |terminated| {
                Inbound::Exchange(ExchangeOutcome::Drifted {
                    session_id,
                    drift: drift.clone(),
                    action,
                    terminated,
                    body: body.clone(),
                })
            };
            match action {
                GovernanceAction::TerminateSession => {
                    machine.lock().await.terminate("semantic drift")?;
                    self.registry.disarm(&session_id);
                    return Ok(outcome(true));
                }
                GovernanceAction::RequireConsensus => {
                    let agreement = self.services.agreement(packet).await;
                    if agreement.value < self.config.consensus_quorum {
                        tracing::warn!(
                            %session_id,
                            agreement = agreement.value,
                            degraded = agreement.degraded,
                            "Drifted exchange lacks consensus"
                        );
                        return Ok(outcome(false));
                    }
                    tracing::info!(%session_id, agreement = agreement.value, "Drifted exchange accepted by consensus");
                }
                _ => {
                    tracing::warn!(%session_id, score = drift.score, action = ?action, "Semantic drift detected");
                    return Ok(outcome(false));
                }
            }
        }

        let novelty = self.services.novelty(&body).await.value;

        let mut machine = machine.lock().await;
        // Re-checked under the lock so a concurrent duplicate cannot slip in.
        let clock = machine.accept_peer_lamport(lamport)?;
        machine.record_exchange(&digest_value(&Value::Object(body.clone())))?;
        machine.set_novelty(novelty)?;
        self.services.observe(lamport);

        Ok(Inbound::Exchange(ExchangeOutcome::Accepted {
            session_id,
            lamport: clock,
            novelty,
            body,
        }))
    }

    async fn machine(&self, session_id: &Uuid) -> SitResult<SharedMachine> {
        self.registry
            .get(session_id)
            .await
            .ok_or(SitError::UnknownSession(*session_id))
    }

    /// Handshake replies for sessions this node never opened are out of order.
    async fn pending_machine(&self, session_id: &Uuid, kind: &str) -> SitResult<SharedMachine> {
        self.registry.get(session_id).await.ok_or_else(|| {
            SitError::UnexpectedIntentSource(format!("{} for unknown session {}", kind, session_id))
        })
    }

    fn frame_packet(&self, frame: &Frame, dst: &str) -> SitResult<Packet> {
        self.codec.create_packet(frame.to_payload()?, self.entity_id(), dst)
    }
}
