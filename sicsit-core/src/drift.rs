//! Drift detection for established sessions.
//!
//! Scoring is a pluggable [`DriftScorer`]; the detector only clamps the score,
//! compares it to the threshold and reports. It never mutates the session.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{SitCode, SitError, SitResult};
use crate::message::SemanticBoundary;
use crate::session::SitState;

/// Default path of declared intent categories in a payload.
pub const DEFAULT_CATEGORY_PATH: &str = "intent.categories";

/// Scores how far a payload strays from a session's boundary.
///
/// Returns a value in `[0, 1]`; 0 means fully within the boundary.
pub trait DriftScorer: Send + Sync {
    fn score(&self, boundary: &SemanticBoundary, payload: &Map<String, Value>) -> f64;
}

/// Fraction of declared categories that fall outside the boundary.
///
/// Categories are read from a dotted path holding a string or an array of
/// strings. A payload that declares nothing scores 1.0.
#[derive(Debug, Clone)]
pub struct CategoryScorer {
    path: Vec<String>,
}

impl Default for CategoryScorer {
    fn default() -> Self {
        Self::at(DEFAULT_CATEGORY_PATH)
    }
}

impl CategoryScorer {
    pub fn at(path: &str) -> Self {
        Self {
            path: path.split('.').map(str::to_string).collect(),
        }
    }

    fn declared(&self, payload: &Map<String, Value>) -> BTreeSet<String> {
        let mut segments = self.path.iter();
        let mut current = match segments.next().and_then(|first| payload.get(first)) {
            Some(value) => value,
            None => return BTreeSet::new(),
        };
        for segment in segments {
            match current.get(segment) {
                Some(next) => current = next,
                None => return BTreeSet::new(),
            }
        }

        match current {
            Value::String(s) => std::iter::once(s.clone()).collect(),
            Value::Array(items) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => BTreeSet::new(),
        }
    }
}

impl DriftScorer for CategoryScorer {
    fn score(&self, boundary: &SemanticBoundary, payload: &Map<String, Value>) -> f64 {
        let declared = self.declared(payload);
        if declared.is_empty() {
            return 1.0;
        }
        let outside = declared.difference(boundary).count();
        outside as f64 / declared.len() as f64
    }
}

/// Keyword overlap between the payload's text and the boundary terms.
///
/// Concepts are alphabetic words longer than three characters, lowercased.
/// The score is the fraction of the payload's concepts absent from the
/// boundary; text without any concept scores 1.0.
#[derive(Debug, Clone, Default)]
pub struct KeywordOverlapScorer {
    field: Option<String>,
}

impl KeywordOverlapScorer {
    /// Only read text under a top-level field.
    pub fn on_field(field: impl Into<String>) -> Self {
        Self {
            field: Some(field.into()),
        }
    }
}

fn concepts(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 3 && w.chars().all(char::is_alphabetic))
        .map(str::to_lowercase)
        .collect()
}

fn collect_text(value: &Value, out: &mut String) {
    match value {
        Value::String(s) => {
            out.push(' ');
            out.push_str(s);
        }
        Value::Array(items) => items.iter().for_each(|v| collect_text(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_text(v, out)),
        _ => {}
    }
}

impl DriftScorer for KeywordOverlapScorer {
    fn score(&self, boundary: &SemanticBoundary, payload: &Map<String, Value>) -> f64 {
        let mut text = String::new();
        match &self.field {
            Some(field) => {
                if let Some(value) = payload.get(field) {
                    collect_text(value, &mut text);
                }
            }
            None => payload.values().for_each(|v| collect_text(v, &mut text)),
        }

        let found = concepts(&text);
        if found.is_empty() {
            return 1.0;
        }
        let allowed: BTreeSet<String> = boundary.iter().flat_map(|term| concepts(term)).collect();
        let outside = found.difference(&allowed).count();
        outside as f64 / found.len() as f64
    }
}

/// Outcome of a drift check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftResult {
    pub drifted: bool,
    pub score: f64,
    pub threshold: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<SitCode>,
}

impl DriftResult {
    /// Convert a drifted result into [`SitError::SemanticDrift`].
    pub fn into_result(self) -> SitResult<DriftResult> {
        if self.drifted {
            Err(SitError::SemanticDrift {
                score: self.score,
                threshold: self.threshold,
            })
        } else {
            Ok(self)
        }
    }
}

/// Compares exchanges against a session's declared boundary.
#[derive(Clone)]
pub struct DriftDetector {
    scorer: Arc<dyn DriftScorer>,
    threshold: f64,
}

impl Default for DriftDetector {
    fn default() -> Self {
        Self::new(Arc::new(CategoryScorer::default()), 0.0)
    }
}

impl std::fmt::Debug for DriftDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriftDetector")
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

impl DriftDetector {
    pub fn new(scorer: Arc<dyn DriftScorer>, threshold: f64) -> Self {
        Self {
            scorer,
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Score `payload` against an established session.
    pub fn check(&self, session: &SitState, payload: &Map<String, Value>) -> SitResult<DriftResult> {
        if !session.is_established() {
            return Err(SitError::NotEstablished(session.session_id));
        }

        let raw = self.scorer.score(&session.semantic_boundary, payload);
        let score = if raw.is_nan() { 1.0 } else { raw.clamp(0.0, 1.0) };
        let drifted = score > self.threshold;
        if drifted {
            tracing::debug!(session_id = %session.session_id, score, threshold = self.threshold, "Drift detected");
        }

        Ok(DriftResult {
            drifted,
            score,
            threshold: self.threshold,
            code: drifted.then_some(SitCode::SemanticDriftDetected),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::SignatureChain;
    use crate::state::{Role, SessionStatus};
    use uuid::Uuid;

    fn session(status: SessionStatus) -> SitState {
        SitState {
            session_id: Uuid::new_v4(),
            role: Role::Initiator,
            entity_a: "alice".to_string(),
            entity_b: "bob".to_string(),
            intent_scope: "billing.read".to_string(),
            semantic_boundary: ["invoices", "payments"].iter().map(|s| s.to_string()).collect(),
            lamport_clock: 0,
            peer_lamport: 0,
            signature_chain: SignatureChain::new(),
            status,
            established_at: None,
            novelty: None,
            termination_reason: None,
        }
    }

    fn payload(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("test payload must be an object"),
        }
    }

    #[test]
    fn within_boundary_does_not_drift() {
        let detector = DriftDetector::default();
        let result = detector
            .check(
                &session(SessionStatus::Established),
                &payload(serde_json::json!({"intent": {"categories": ["invoices"]}})),
            )
            .unwrap();
        assert!(!result.drifted);
        assert_eq!(result.score, 0.0);
        assert!(result.code.is_none());
    }

    #[test]
    fn outside_boundary_drifts() {
        let detector = DriftDetector::default();
        let result = detector
            .check(
                &session(SessionStatus::Established),
                &payload(serde_json::json!({"intent": {"categories": ["invoices", "payroll"]}})),
            )
            .unwrap();
        assert!(result.drifted);
        assert_eq!(result.score, 0.5);
        assert_eq!(result.code, Some(SitCode::SemanticDriftDetected));
        assert!(matches!(
            result.into_result(),
            Err(SitError::SemanticDrift { .. })
        ));
    }

    #[test]
    fn threshold_tolerates_partial_overlap() {
        let detector = DriftDetector::new(Arc::new(CategoryScorer::default()), 0.5);
        let result = detector
            .check(
                &session(SessionStatus::Established),
                &payload(serde_json::json!({"intent": {"categories": ["invoices", "payroll"]}})),
            )
            .unwrap();
        assert!(!result.drifted);
    }

    #[test]
    fn undeclared_intent_scores_maximum() {
        let scorer = CategoryScorer::default();
        let boundary = session(SessionStatus::Established).semantic_boundary;
        assert_eq!(scorer.score(&boundary, &payload(serde_json::json!({}))), 1.0);
        assert_eq!(
            scorer.score(&boundary, &payload(serde_json::json!({"intent": {"categories": 3}}))),
            1.0
        );
    }

    #[test]
    fn custom_category_path_and_single_string() {
        let scorer = CategoryScorer::at("topic");
        let boundary = session(SessionStatus::Established).semantic_boundary;
        assert_eq!(
            scorer.score(&boundary, &payload(serde_json::json!({"topic": "payments"}))),
            0.0
        );
    }

    #[test]
    fn requires_established_session() {
        let detector = DriftDetector::default();
        assert!(matches!(
            detector.check(
                &session(SessionStatus::PendingAck),
                &payload(serde_json::json!({}))
            ),
            Err(SitError::NotEstablished(_))
        ));
    }

    struct NanScorer;

    impl DriftScorer for NanScorer {
        fn score(&self, _: &SemanticBoundary, _: &Map<String, Value>) -> f64 {
            f64::NAN
        }
    }

    #[test]
    fn nan_scores_count_as_drift() {
        let detector = DriftDetector::new(Arc::new(NanScorer), 0.9);
        let result = detector
            .check(&session(SessionStatus::Established), &payload(serde_json::json!({})))
            .unwrap();
        assert!(result.drifted);
        assert_eq!(result.score, 1.0);
    }

    #[test]
    fn keyword_overlap_scores_concepts() {
        let scorer = KeywordOverlapScorer::on_field("text");
        let boundary: SemanticBoundary = ["invoices", "payment-status"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let inside = payload(serde_json::json!({"text": "List INVOICES with payment status"}));
        // "list" and "with" are concepts too; only "invoices", "payment" and
        // "status" are covered.
        let score = scorer.score(&boundary, &inside);
        assert!((score - 0.4).abs() < 1e-9);

        let outside = payload(serde_json::json!({"text": "export employee salaries"}));
        assert_eq!(scorer.score(&boundary, &outside), 1.0);

        let empty = payload(serde_json::json!({"text": "a b c"}));
        assert_eq!(scorer.score(&boundary, &empty), 1.0);
    }
}
