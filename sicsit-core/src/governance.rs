//! Governance dispatch.
//!
//! Every rejection and every drift is classified as a [`Violation`] and
//! resolved to a [`GovernanceAction`] through a [`GovernanceTable`]. The set
//! of violations and actions is closed so the table can be audited and
//! matched exhaustively.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{FirewallCode, SitError};

/// Governance axioms that can be violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Violation {
    /// A1: an operation crossed an undefined boundary.
    BoundaryFault,
    /// A2: payload is raw data, not a semantic intent.
    NonSemanticIntent,
    /// A3: payload is not structured.
    UnstructuredPayload,
    /// A4: the operation would replace a human decision.
    ReplacesHumanWill,
    /// A6: a claim was made without quantification.
    UnquantifiedClaim,
    /// A7: exchange diverged from the agreed semantics.
    SemanticInconsistency,
    /// A8: no temporal marker.
    MissingTemporalMarker,
    /// A9: wire format not respected.
    FormatNonCompliant,
    /// A10: structure could not be verified.
    StructureUnverified,
    /// A11: no network consensus.
    ConsensusMissing,
    /// A12: insufficient entropy.
    EntropyInsufficient,
    /// A13: no causal ordering.
    MissingCausalOrder,
    /// A14: a signature did not verify.
    SignatureUnverified,
    /// A15: governance complexity crossed its critical point.
    ComplexityOverflow,
    /// A16: participation fairness was sacrificed.
    FairnessViolated,
}

/// Actions a violation can resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GovernanceAction {
    RejectAndLog,
    TransformToIntent,
    Sanitize,
    HaltAndEscalate,
    RequestQuantification,
    RealignSemantics,
    AddTemporalMarker,
    RejectReformat,
    VerifyStructure,
    RequireConsensus,
    InjectEntropy,
    AddLamportTimestamp,
    RequireSignature,
    TriggerCompression,
    ApplySwat,
    TerminateSession,
}

/// Threshold on [`OperationContext::complexity_score`].
pub const COMPLEXITY_CRITICAL_POINT: f64 = 4.0;

/// Minimum [`OperationContext::fairness_score`].
pub const FAIRNESS_FLOOR: f64 = 0.5;

/// Facts about an operation, checked against every axiom.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationContext {
    pub boundary_defined: bool,
    pub is_semantic_intent: bool,
    pub is_structured: bool,
    pub replaces_human_will: bool,
    pub is_quantifiable: bool,
    pub semantic_consistent: bool,
    pub has_temporal_marker: bool,
    pub format_compliant: bool,
    pub structure_verified: bool,
    pub network_consensus: bool,
    pub entropy_sufficient: bool,
    pub has_causal_order: bool,
    pub signature_verified: bool,
    pub complexity_score: f64,
    pub fairness_score: f64,
}

impl OperationContext {
    /// A context satisfying every axiom.
    pub fn compliant() -> Self {
        Self {
            boundary_defined: true,
            is_semantic_intent: true,
            is_structured: true,
            replaces_human_will: false,
            is_quantifiable: true,
            semantic_consistent: true,
            has_temporal_marker: true,
            format_compliant: true,
            structure_verified: true,
            network_consensus: true,
            entropy_sufficient: true,
            has_causal_order: true,
            signature_verified: true,
            complexity_score: 0.0,
            fairness_score: 1.0,
        }
    }
}

impl Violation {
    pub const ALL: [Violation; 15] = [
        Self::BoundaryFault,
        Self::NonSemanticIntent,
        Self::UnstructuredPayload,
        Self::ReplacesHumanWill,
        Self::UnquantifiedClaim,
        Self::SemanticInconsistency,
        Self::MissingTemporalMarker,
        Self::FormatNonCompliant,
        Self::StructureUnverified,
        Self::ConsensusMissing,
        Self::EntropyInsufficient,
        Self::MissingCausalOrder,
        Self::SignatureUnverified,
        Self::ComplexityOverflow,
        Self::FairnessViolated,
    ];

    /// Axiom identifier.
    pub fn axiom(&self) -> &'static str {
        match self {
            Self::BoundaryFault => "A1",
            Self::NonSemanticIntent => "A2",
            Self::UnstructuredPayload => "A3",
            Self::ReplacesHumanWill => "A4",
            Self::UnquantifiedClaim => "A6",
            Self::SemanticInconsistency => "A7",
            Self::MissingTemporalMarker => "A8",
            Self::FormatNonCompliant => "A9",
            Self::StructureUnverified => "A10",
            Self::ConsensusMissing => "A11",
            Self::EntropyInsufficient => "A12",
            Self::MissingCausalOrder => "A13",
            Self::SignatureUnverified => "A14",
            Self::ComplexityOverflow => "A15",
            Self::FairnessViolated => "A16",
        }
    }

    /// Action taken when no override is configured.
    pub fn default_action(&self) -> GovernanceAction {
        use GovernanceAction as A;
        match self {
            Self::BoundaryFault => A::RejectAndLog,
            Self::NonSemanticIntent => A::TransformToIntent,
            Self::UnstructuredPayload => A::Sanitize,
            Self::ReplacesHumanWill => A::HaltAndEscalate,
            Self::UnquantifiedClaim => A::RequestQuantification,
            Self::SemanticInconsistency => A::RealignSemantics,
            Self::MissingTemporalMarker => A::AddTemporalMarker,
            Self::FormatNonCompliant => A::RejectReformat,
            Self::StructureUnverified => A::VerifyStructure,
            Self::ConsensusMissing => A::RequireConsensus,
            Self::EntropyInsufficient => A::InjectEntropy,
            Self::MissingCausalOrder => A::AddLamportTimestamp,
            Self::SignatureUnverified => A::RequireSignature,
            Self::ComplexityOverflow => A::TriggerCompression,
            Self::FairnessViolated => A::ApplySwat,
        }
    }

    /// Whether `ctx` violates this axiom.
    pub fn violated_by(&self, ctx: &OperationContext) -> bool {
        match self {
            Self::BoundaryFault => !ctx.boundary_defined,
            Self::NonSemanticIntent => !ctx.is_semantic_intent,
            Self::UnstructuredPayload => !ctx.is_structured,
            Self::ReplacesHumanWill => ctx.replaces_human_will,
            Self::UnquantifiedClaim => !ctx.is_quantifiable,
            Self::SemanticInconsistency => !ctx.semantic_consistent,
            Self::MissingTemporalMarker => !ctx.has_temporal_marker,
            Self::FormatNonCompliant => !ctx.format_compliant,
            Self::StructureUnverified => !ctx.structure_verified,
            Self::ConsensusMissing => !ctx.network_consensus,
            Self::EntropyInsufficient => !ctx.entropy_sufficient,
            Self::MissingCausalOrder => !ctx.has_causal_order,
            Self::SignatureUnverified => !ctx.signature_verified,
            Self::ComplexityOverflow => ctx.complexity_score >= COMPLEXITY_CRITICAL_POINT,
            Self::FairnessViolated => ctx.fairness_score <= FAIRNESS_FLOOR,
        }
    }

    /// Classify a rejection. Local configuration and service failures are
    /// not violations by a peer.
    pub fn from_error(error: &SitError) -> Option<Violation> {
        let violation = match error {
            SitError::Denied {
                code: FirewallCode::InjectionDetected,
                ..
            } => Self::UnstructuredPayload,
            SitError::Denied { .. } | SitError::Expired { .. } | SitError::Misdirected { .. } => {
                Self::BoundaryFault
            }
            SitError::MalformedPayload(_) | SitError::HashMismatch { .. } | SitError::Serialization(_) => {
                Self::FormatNonCompliant
            }
            SitError::SignatureInvalid
            | SitError::Crypto(_)
            | SitError::ChainBroken(_)
            | SitError::UnknownPeer(_) => Self::SignatureUnverified,
            SitError::SemanticDrift { .. } => Self::SemanticInconsistency,
            SitError::ReplayDetected { .. }
            | SitError::UnexpectedIntentSource(_)
            | SitError::NonceMismatch { .. }
            | SitError::ScopeMismatch(_)
            | SitError::UnknownSession(_)
            | SitError::NotEstablished(_) => Self::StructureUnverified,
            SitError::DeadlineExpired(_) => Self::MissingTemporalMarker,
            SitError::LedgerSaturated(_) => Self::ComplexityOverflow,
            SitError::PolicyInvalid(_) | SitError::Config(_) | SitError::ServiceUnavailable { .. } => {
                return None
            }
        };
        Some(violation)
    }
}

/// Result of assessing a set of violations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernanceVerdict {
    pub violations: Vec<Violation>,
    pub actions: Vec<GovernanceAction>,
    /// A4 was violated; all other actions are suppressed.
    pub halted: bool,
}

impl GovernanceVerdict {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Violation to action lookup with per-violation overrides.
#[derive(Debug, Clone, Default)]
pub struct GovernanceTable {
    overrides: HashMap<Violation, GovernanceAction>,
}

impl GovernanceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `violation` to `action` instead of its default.
    ///
    /// A4 always halts and cannot be overridden.
    pub fn with_override(mut self, violation: Violation, action: GovernanceAction) -> Self {
        if violation != Violation::ReplacesHumanWill {
            self.overrides.insert(violation, action);
        }
        self
    }

    pub fn resolve(&self, violation: Violation) -> GovernanceAction {
        self.overrides
            .get(&violation)
            .copied()
            .unwrap_or_else(|| violation.default_action())
    }

    /// Resolve every violation; A4 takes absolute priority.
    pub fn assess(&self, violations: &[Violation]) -> GovernanceVerdict {
        if violations.contains(&Violation::ReplacesHumanWill) {
            return GovernanceVerdict {
                violations: violations.to_vec(),
                actions: vec![GovernanceAction::HaltAndEscalate],
                halted: true,
            };
        }

        GovernanceVerdict {
            violations: violations.to_vec(),
            actions: violations.iter().map(|v| self.resolve(*v)).collect(),
            halted: false,
        }
    }

    /// Check an operation against every axiom.
    pub fn validate(&self, ctx: &OperationContext) -> GovernanceVerdict {
        let violations: Vec<Violation> = Violation::ALL
            .iter()
            .copied()
            .filter(|v| v.violated_by(ctx))
            .collect();
        self.assess(&violations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn axioms_are_unique() {
        let ids: std::collections::HashSet<_> = Violation::ALL.iter().map(|v| v.axiom()).collect();
        assert_eq!(ids.len(), Violation::ALL.len());
    }

    #[test]
    fn defaults_follow_the_axiom_table() {
        let table = GovernanceTable::new();
        assert_eq!(table.resolve(Violation::UnstructuredPayload), GovernanceAction::Sanitize);
        assert_eq!(
            table.resolve(Violation::ComplexityOverflow),
            GovernanceAction::TriggerCompression
        );
        assert_eq!(
            table.resolve(Violation::SemanticInconsistency),
            GovernanceAction::RealignSemantics
        );
    }

    #[test]
    fn overrides_replace_defaults() {
        let table = GovernanceTable::new()
            .with_override(Violation::SemanticInconsistency, GovernanceAction::TerminateSession);
        assert_eq!(
            table.resolve(Violation::SemanticInconsistency),
            GovernanceAction::TerminateSession
        );
        assert_eq!(table.resolve(Violation::BoundaryFault), GovernanceAction::RejectAndLog);
    }

    #[test]
    fn human_will_violation_halts_everything() {
        let table = GovernanceTable::new()
            .with_override(Violation::ReplacesHumanWill, GovernanceAction::RejectAndLog);
        let verdict = table.assess(&[Violation::BoundaryFault, Violation::ReplacesHumanWill]);
        assert!(verdict.halted);
        assert_eq!(verdict.actions, vec![GovernanceAction::HaltAndEscalate]);
        assert_eq!(verdict.violations.len(), 2);
    }

    #[test]
    fn compliant_context_is_clean() {
        let table = GovernanceTable::new();
        let verdict = table.validate(&OperationContext::compliant());
        assert!(verdict.is_clean());
        assert!(verdict.actions.is_empty());

        let mut ctx = OperationContext::compliant();
        ctx.signature_verified = false;
        ctx.complexity_score = 4.5;
        let verdict = table.validate(&ctx);
        assert_eq!(
            verdict.violations,
            vec![Violation::SignatureUnverified, Violation::ComplexityOverflow]
        );
        assert_eq!(
            verdict.actions,
            vec![GovernanceAction::RequireSignature, GovernanceAction::TriggerCompression]
        );
    }

    #[test]
    fn errors_classify_into_violations() {
        let injection = SitError::Denied {
            code: FirewallCode::InjectionDetected,
            reason: String::new(),
        };
        assert_eq!(Violation::from_error(&injection), Some(Violation::UnstructuredPayload));

        let missing = SitError::Denied {
            code: FirewallCode::MissingRequired,
            reason: String::new(),
        };
        assert_eq!(Violation::from_error(&missing), Some(Violation::BoundaryFault));
        assert_eq!(
            Violation::from_error(&SitError::SignatureInvalid),
            Some(Violation::SignatureUnverified)
        );
        assert_eq!(
            Violation::from_error(&SitError::DeadlineExpired(Uuid::nil())),
            Some(Violation::MissingTemporalMarker)
        );
        assert_eq!(Violation::from_error(&SitError::Config("x".into())), None);
    }

    #[test]
    fn actions_serialize_in_screaming_case() {
        assert_eq!(
            serde_json::to_string(&GovernanceAction::HaltAndEscalate).unwrap(),
            "\"HALT_AND_ESCALATE\""
        );
    }
}
