//! Runtime artifacts of a card run.
//!
//! These types are the single source of truth for what the engine returns.
//! The HTTP API, the CLI and the audit log all serialize them as-is.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ErrorBody;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier of one card execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Evidence document identifier (row id in the evidence table).
pub type DocumentId = i64;

// ============================================================================
// Plan vocabulary
// ============================================================================

/// The four step kinds a card plan is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Retrieve,
    Dispatch,
    Gate,
    Compose,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Retrieve => "retrieve",
            StepKind::Dispatch => "dispatch",
            StepKind::Gate => "gate",
            StepKind::Compose => "compose",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared type of a card input field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    List,
    Object,
    Any,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::List => "list",
            FieldType::Object => "object",
            FieldType::Any => "any",
        }
    }

    /// Whether `value` conforms to this type. `null` never matches.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::List => value.is_array(),
            FieldType::Object => value.is_object(),
            FieldType::Any => !value.is_null(),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON type name used in validation messages.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

// ============================================================================
// Evidence
// ============================================================================

/// A stored evidence document. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub space: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A document submitted for writeback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDocument {
    #[serde(default)]
    pub space: String,
    #[serde(default)]
    pub content: String,
}

impl NewDocument {
    pub fn new(space: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            space: space.into(),
            content: content.into(),
        }
    }
}

/// Result of grounding a query against the evidence store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grounding {
    /// Selected documents' content joined by a blank line.
    pub answer: String,
    pub documents: Vec<Document>,
    /// Selected / total documents in scope.
    pub coverage: f64,
    pub caveats: Vec<String>,
}

// ============================================================================
// Dispatch & arbitration
// ============================================================================

/// One backend's raw output for a dispatch step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub backend_id: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Candidate {
    pub fn ok(backend_id: impl Into<String>, payload: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            backend_id: backend_id.into(),
            payload: payload.into(),
            latency_ms,
            error: None,
        }
    }

    pub fn failed(backend_id: impl Into<String>, error: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            backend_id: backend_id.into(),
            payload: String::new(),
            latency_ms,
            error: Some(error.into()),
        }
    }

    pub fn is_viable(&self) -> bool {
        self.error.is_none()
    }

    pub fn summary(&self) -> CandidateSummary {
        CandidateSummary {
            backend_id: self.backend_id.clone(),
            latency_ms: self.latency_ms,
            error: self.error.clone(),
        }
    }
}

/// Candidate without its payload, kept in the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateSummary {
    pub backend_id: String,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The arbiter's decision for one dispatch step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Judgement {
    pub winner: String,
    pub payload: String,
    /// backend id -> rubric score (0 for errored candidates)
    pub scores: BTreeMap<String, f64>,
    pub rationale: String,
    /// Other viable backends, in registration order.
    pub dissent: Vec<String>,
    pub candidates: Vec<Candidate>,
}

impl Judgement {
    pub fn winning_score(&self) -> f64 {
        self.scores.get(&self.winner).copied().unwrap_or(0.0)
    }
}

/// Output of a self-check over a single text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfCheck {
    pub score: f64,
    pub details: BTreeMap<String, f64>,
}

// ============================================================================
// Policy
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Redacted,
    Blocked,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Pass => "pass",
            Verdict::Redacted => "redacted",
            Verdict::Blocked => "blocked",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Policy gate output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyResult {
    pub verdict: Verdict,
    /// Absent only when blocked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacted_payload: Option<Value>,
    /// `policy:rule` identifiers in evaluation order.
    pub violations: Vec<String>,
}

impl PolicyResult {
    pub fn is_blocked(&self) -> bool {
        self.verdict == Verdict::Blocked
    }
}

// ============================================================================
// Audit trail & dossier
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Ok,
    Failed,
    Blocked,
}

impl StepOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepOutcome::Ok => "ok",
            StepOutcome::Failed => "failed",
            StepOutcome::Blocked => "blocked",
        }
    }
}

/// One step invocation, appended before the executor moves on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub step: String,
    pub kind: StepKind,
    pub target: String,
    pub outcome: StepOutcome,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidates: Option<Vec<CandidateSummary>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Blocked,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Blocked => "blocked",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final audited result of one card execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dossier {
    pub run_id: RunId,
    pub card: String,
    pub version: String,
    /// Validated inputs with defaults applied.
    pub inputs: Value,
    /// Output of the last step that ran.
    pub output: Value,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    pub audit: Vec<AuditEntry>,
    pub evidence: Vec<Document>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl Dossier {
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Step ids in audit order.
    pub fn audited_steps(&self) -> Vec<&str> {
        self.audit.iter().map(|e| e.step.as_str()).collect()
    }
}
