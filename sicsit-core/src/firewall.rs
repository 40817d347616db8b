//! Semantic firewall.
//!
//! Evaluates structured intent payloads against an ordered [`Policy`]. The
//! first violated rule denies the payload with that rule's code; a payload
//! violating nothing passes. Evaluation never mutates the payload or policy
//! and is safe to run concurrently from many tasks.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{FirewallCode, SitError, SitResult};

/// Field selector meaning "the whole payload".
pub const WHOLE_PAYLOAD: &str = "*";

/// Rule constraint kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Constraint {
    /// The field must be present and non-empty.
    Required,
    /// The field must be absent.
    Forbidden,
    /// No string leaf anywhere in the payload may match the regex. The
    /// rule's field only labels the rule.
    PatternDeny(String),
    /// A numeric field, when present, must lie within the bounds.
    Range {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    /// The field holds the requester's clearance, which must reach the
    /// level. An absent clearance counts as level 0.
    MinClearance(i64),
}

impl Constraint {
    /// The only code a rule of this kind may report.
    pub fn expected_code(&self) -> FirewallCode {
        match self {
            Self::Required => FirewallCode::MissingRequired,
            Self::Forbidden => FirewallCode::ForbiddenField,
            Self::PatternDeny(_) => FirewallCode::InjectionDetected,
            Self::Range { .. } => FirewallCode::PolicyViolation,
            Self::MinClearance(_) => FirewallCode::ClearanceInsufficient,
        }
    }

    /// Short name used in audit entries.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Required => "REQUIRED",
            Self::Forbidden => "FORBIDDEN",
            Self::PatternDeny(_) => "PATTERN_DENY",
            Self::Range { .. } => "RANGE",
            Self::MinClearance(_) => "MIN_CLEARANCE",
        }
    }
}

/// A single policy rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Dotted path (`requester.id`), `**.key` for any depth, or `*`.
    pub field: String,
    pub constraint: Constraint,
    pub code: FirewallCode,
}

impl Rule {
    pub fn required(field: impl Into<String>) -> Self {
        Self::with_constraint(field, Constraint::Required)
    }

    pub fn forbidden(field: impl Into<String>) -> Self {
        Self::with_constraint(field, Constraint::Forbidden)
    }

    pub fn pattern_deny(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::with_constraint(field, Constraint::PatternDeny(pattern.into()))
    }

    pub fn range(field: impl Into<String>, min: Option<f64>, max: Option<f64>) -> Self {
        Self::with_constraint(field, Constraint::Range { min, max })
    }

    pub fn min_clearance(field: impl Into<String>, level: i64) -> Self {
        Self::with_constraint(field, Constraint::MinClearance(level))
    }

    fn with_constraint(field: impl Into<String>, constraint: Constraint) -> Self {
        let code = constraint.expected_code();
        Self {
            field: field.into(),
            constraint,
            code,
        }
    }
}

/// Versioned, ordered rule set supplied by the policy store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default = "default_version")]
    pub version: String,
    pub rules: Vec<Rule>,
}

fn default_version() -> String {
    "unversioned".to_string()
}

impl Policy {
    pub fn new(version: impl Into<String>, rules: Vec<Rule>) -> Self {
        Self {
            version: version.into(),
            rules,
        }
    }

    /// Parse a policy document.
    pub fn from_json(document: &str) -> SitResult<Self> {
        serde_json::from_str(document)
            .map_err(|e| SitError::PolicyInvalid(format!("unparseable policy document: {}", e)))
    }

    /// Opt-in injection patterns covering prompt, SQL, script and code
    /// injection. Scans the whole payload.
    pub fn baseline_injection_rules() -> Vec<Rule> {
        [
            r"(?i)ignore\s+(all\s+)?(previous|prior|above)\s+instructions",
            r"(?i)disregard\s+.*previous",
            r"(?i)forget\s+.*everything",
            r"(?i)you\s+are\s+now\s+",
            r"(?i)reveal\s+.*(instructions|system\s*prompt)",
            r"(?i)jailbreak",
            r"(?i)(drop|delete|truncate)\s+table",
            r"(?i)union\s+select",
            r"(?i)'\s*or\s+1\s*=\s*1",
            r"(?i)<script[^>]*>",
            r"(?i)javascript:",
            r"(?i)on(load|error|click|mouseover|focus)\s*=",
            r"(?i)\b(eval|exec|execfile)\s*\(",
            r"(?i)import\s+(os|subprocess|sys)\b",
        ]
        .into_iter()
        .map(|pattern| Rule::pattern_deny(WHOLE_PAYLOAD, pattern))
        .collect()
    }
}

/// Firewall decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FirewallAction {
    Pass,
    Deny,
}

/// One rule check recorded during an evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub rule_index: usize,
    pub field: String,
    pub constraint: String,
    pub outcome: FirewallAction,
}

/// Outcome of a firewall evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallResult {
    pub action: FirewallAction,
    pub code: FirewallCode,
    pub reason: String,
    /// Index of the rule that denied, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_index: Option<usize>,
    pub policy_version: String,
    /// Every rule checked, in order, up to and including a denying one.
    pub audit: Vec<AuditEntry>,
    pub evaluated_at: DateTime<Utc>,
}

/// Equality ignores `evaluated_at`.
impl PartialEq for FirewallResult {
    fn eq(&self, other: &Self) -> bool {
        self.action == other.action
            && self.code == other.code
            && self.reason == other.reason
            && self.rule_index == other.rule_index
            && self.policy_version == other.policy_version
            && self.audit == other.audit
    }
}

impl FirewallResult {
    pub fn is_pass(&self) -> bool {
        self.action == FirewallAction::Pass
    }

    /// Convert a denial into [`SitError::Denied`].
    pub fn into_result(self) -> SitResult<()> {
        match self.action {
            FirewallAction::Pass => Ok(()),
            FirewallAction::Deny => Err(SitError::Denied {
                code: self.code,
                reason: self.reason,
            }),
        }
    }
}

/// Parsed form of a rule's `field`.
#[derive(Debug, Clone)]
enum FieldPath {
    Whole,
    Dotted(Vec<String>),
    AnyDepth(String),
}

impl FieldPath {
    fn parse(field: &str) -> SitResult<Self> {
        let field = field.trim();
        if field.is_empty() || field == WHOLE_PAYLOAD {
            return Ok(Self::Whole);
        }
        if let Some(key) = field.strip_prefix("**.") {
            if key.is_empty() || key.contains('.') {
                return Err(SitError::PolicyInvalid(format!(
                    "`**.` must be followed by a single key: {}",
                    field
                )));
            }
            return Ok(Self::AnyDepth(key.to_string()));
        }
        let segments: Vec<String> = field.split('.').map(str::to_string).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(SitError::PolicyInvalid(format!("empty path segment in `{}`", field)));
        }
        Ok(Self::Dotted(segments))
    }
}

#[derive(Debug)]
struct CompiledRule {
    rule: Rule,
    path: FieldPath,
    pattern: Option<Regex>,
}

impl CompiledRule {
    fn compile(index: usize, rule: &Rule) -> SitResult<Self> {
        let expected = rule.constraint.expected_code();
        if rule.code != expected {
            return Err(SitError::PolicyInvalid(format!(
                "rule {} on `{}` declares {} but its constraint reports {}",
                index,
                rule.field,
                rule.code.name(),
                expected.name()
            )));
        }

        let path = FieldPath::parse(&rule.field)?;
        let pattern = match (&rule.constraint, &path) {
            (Constraint::PatternDeny(raw), _) => {
                Some(Regex::new(raw).map_err(|e| {
                    SitError::PolicyInvalid(format!("rule {} has invalid pattern: {}", index, e))
                })?)
            }
            (Constraint::Forbidden, FieldPath::Dotted(_) | FieldPath::AnyDepth(_)) => None,
            (
                Constraint::Required | Constraint::Range { .. } | Constraint::MinClearance(_),
                FieldPath::Dotted(_),
            ) => None,
            _ => {
                return Err(SitError::PolicyInvalid(format!(
                    "rule {} cannot apply {:?} to `{}`",
                    index, rule.constraint, rule.field
                )))
            }
        };

        Ok(Self {
            rule: rule.clone(),
            path,
            pattern,
        })
    }

    /// Describe the violation, if the payload violates this rule.
    fn violation(&self, payload: &Map<String, Value>) -> Option<String> {
        let field = &self.rule.field;
        match (&self.rule.constraint, &self.path) {
            (Constraint::Required, FieldPath::Dotted(segments)) => {
                match lookup(payload, segments) {
                    None | Some(Value::Null) => Some(format!("missing required field `{}`", field)),
                    Some(Value::String(s)) if s.trim().is_empty() => {
                        Some(format!("required field `{}` is empty", field))
                    }
                    Some(Value::Object(m)) if m.is_empty() => {
                        Some(format!("required field `{}` is empty", field))
                    }
                    Some(Value::Array(a)) if a.is_empty() => {
                        Some(format!("required field `{}` is empty", field))
                    }
                    Some(_) => None,
                }
            }
            (Constraint::Forbidden, FieldPath::Dotted(segments)) => lookup(payload, segments)
                .map(|_| format!("forbidden field `{}` present", field)),
            (Constraint::Forbidden, FieldPath::AnyDepth(key)) => {
                find_key(payload, key, "").map(|at| format!("forbidden field `{}` present", at))
            }
            (Constraint::PatternDeny(_), _) => {
                let regex = self.pattern.as_ref()?;
                first_match_in_map(payload, regex, "")
                    .map(|at| format!("deny pattern matched string at `{}`", at))
            }
            (Constraint::Range { min, max }, FieldPath::Dotted(segments)) => {
                let value = lookup(payload, segments)?;
                let Some(n) = value.as_f64() else {
                    return Some(format!("field `{}` must be numeric", field));
                };
                let below = min.is_some_and(|m| n < m);
                let above = max.is_some_and(|m| n > m);
                (below || above).then(|| format!("field `{}` = {} is out of bounds", field, n))
            }
            (Constraint::MinClearance(level), FieldPath::Dotted(segments)) => {
                let clearance = match lookup(payload, segments) {
                    None | Some(Value::Null) => 0,
                    Some(value) => match value.as_i64() {
                        Some(n) => n,
                        None => return Some(format!("clearance `{}` must be an integer", field)),
                    },
                };
                (clearance < *level).then(|| {
                    format!("clearance {} at `{}` is below {}", clearance, field, level)
                })
            }
            _ => None,
        }
    }
}

/// Compiled policy evaluator.
#[derive(Debug)]
pub struct Firewall {
    version: String,
    rules: Vec<CompiledRule>,
}

impl Firewall {
    /// Compile a policy. Fails if any rule is malformed.
    pub fn new(policy: &Policy) -> SitResult<Self> {
        let rules = policy
            .rules
            .iter()
            .enumerate()
            .map(|(index, rule)| CompiledRule::compile(index, rule))
            .collect::<SitResult<Vec<_>>>()?;

        Ok(Self {
            version: policy.version.clone(),
            rules,
        })
    }

    pub fn policy_version(&self) -> &str {
        &self.version
    }

    /// Evaluate a payload. Rules apply in declaration order.
    pub fn evaluate(&self, payload: &Map<String, Value>) -> FirewallResult {
        let evaluated_at = Utc::now();
        let mut audit = Vec::with_capacity(self.rules.len());

        for (index, compiled) in self.rules.iter().enumerate() {
            let violation = compiled.violation(payload);
            audit.push(AuditEntry {
                rule_index: index,
                field: compiled.rule.field.clone(),
                constraint: compiled.rule.constraint.kind().to_string(),
                outcome: if violation.is_some() {
                    FirewallAction::Deny
                } else {
                    FirewallAction::Pass
                },
            });
            if let Some(reason) = violation {
                return FirewallResult {
                    action: FirewallAction::Deny,
                    code: compiled.rule.code,
                    reason,
                    rule_index: Some(index),
                    policy_version: self.version.clone(),
                    audit,
                    evaluated_at,
                };
            }
        }

        FirewallResult {
            action: FirewallAction::Pass,
            code: FirewallCode::Pass,
            reason: "no rule violated".to_string(),
            rule_index: None,
            policy_version: self.version.clone(),
            audit,
            evaluated_at,
        }
    }
}

/// Compile `policy` and evaluate `payload` against it.
pub fn evaluate(payload: &Map<String, Value>, policy: &Policy) -> SitResult<FirewallResult> {
    Ok(Firewall::new(policy)?.evaluate(payload))
}

fn lookup<'a>(payload: &'a Map<String, Value>, segments: &[String]) -> Option<&'a Value> {
    let (first, rest) = segments.split_first()?;
    let mut current = payload.get(first)?;
    for segment in rest {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", path, key)
    }
}

fn find_key(map: &Map<String, Value>, key: &str, path: &str) -> Option<String> {
    for (k, v) in map {
        let here = join(path, k);
        if k.eq_ignore_ascii_case(key) {
            return Some(here);
        }
        if let Some(found) = find_key_in_value(v, key, &here) {
            return Some(found);
        }
    }
    None
}

fn find_key_in_value(value: &Value, key: &str, path: &str) -> Option<String> {
    match value {
        Value::Object(map) => find_key(map, key, path),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .find_map(|(i, item)| find_key_in_value(item, key, &format!("{}[{}]", path, i))),
        _ => None,
    }
}

fn first_match_in_map(map: &Map<String, Value>, regex: &Regex, path: &str) -> Option<String> {
    map.iter()
        .find_map(|(k, v)| first_match(v, regex, &join(path, k)))
}

fn first_match(value: &Value, regex: &Regex, path: &str) -> Option<String> {
    match value {
        Value::String(s) => regex.is_match(s).then(|| path.to_string()),
        Value::Object(map) => first_match_in_map(map, regex, path),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .find_map(|(i, item)| first_match(item, regex, &format!("{}[{}]", path, i))),
        _ => None,
    }
}
