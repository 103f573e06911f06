//! Card Plan Executor - run one card against one input payload.
//!
//! # Run lifecycle
//!
//! ```text
//! lookup card ──► preflight ──► validate inputs ──► step 1 ──► step 2 ──► ... ──► Dossier
//!      │              │                │               │
//!   config         config         validation      audit entry appended
//!   error          error            error         before the next step
//! ```
//!
//! Errors before the first step return `Err` and produce no Dossier. Once
//! steps start, every outcome ends in a Dossier:
//!
//! - gate verdict `blocked` (or a verdict listed in `halt_on`): status
//!   `blocked`, later steps never run
//! - required step fails: status `failed`, error names the step
//! - optional step fails: output recorded as `null`, run continues
//! - cancellation: checked between steps, run ends `failed`
//!
//! The one exception is a configuration error raised mid-run (for example a
//! backend id that only becomes known from a resolved reference); it aborts
//! the run with `Err` like a preflight failure.

use crate::arbiter::Rubric;
use crate::audit::AuditLog;
use crate::cancel::CancellationToken;
use crate::card::{ArgValue, Card, Step, Target};
use crate::catalog::CardCatalog;
use crate::config::Components;
use crate::context::ExecutionContext;
use crate::metrics::METRICS;
use atlas_db::AtlasDb;
use atlas_protocol::defaults::{CANCELLED_BY_CALLER_MESSAGE, DEFAULT_TOP_K};
use atlas_protocol::telemetry::events;
use atlas_protocol::{
    json_type_name, AuditEntry, CandidateSummary, Dossier, EngineError, ErrorKind, NewDocument,
    RunId, RunStatus, StepOutcome, Verdict,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// What a step hands back to the run loop.
struct StepOutput {
    value: Value,
    detail: Option<String>,
    candidates: Option<Vec<CandidateSummary>>,
    /// Set by a gate step whose verdict halts the run.
    halt: Option<EngineError>,
}

impl StepOutput {
    fn new(value: Value) -> Self {
        Self {
            value,
            detail: None,
            candidates: None,
            halt: None,
        }
    }

    fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Clone)]
pub struct CardExecutor {
    catalog: Arc<CardCatalog>,
    components: Components,
    evidence: AtlasDb,
    audit_log: Option<Arc<AuditLog>>,
}

impl CardExecutor {
    pub fn new(catalog: CardCatalog, components: Components, evidence: AtlasDb) -> Self {
        Self {
            catalog: Arc::new(catalog),
            components,
            evidence,
            audit_log: None,
        }
    }

    pub fn with_audit_log(mut self, log: Arc<AuditLog>) -> Self {
        self.audit_log = Some(log);
        self
    }

    pub fn catalog(&self) -> &CardCatalog {
        &self.catalog
    }

    pub fn components(&self) -> &Components {
        &self.components
    }

    pub fn evidence(&self) -> &AtlasDb {
        &self.evidence
    }

    /// Execute `card_name` with `inputs` to completion.
    pub async fn execute(&self, card_name: &str, inputs: Value) -> Result<Dossier, EngineError> {
        self.execute_with_cancel(card_name, inputs, &CancellationToken::new())
            .await
    }

    /// Execute, checking `cancel` before each step.
    pub async fn execute_with_cancel(
        &self,
        card_name: &str,
        inputs: Value,
        cancel: &CancellationToken,
    ) -> Result<Dossier, EngineError> {
        let prepared = self
            .catalog
            .get(card_name)
            .and_then(|card| self.preflight(&card).map(|_| card))
            .and_then(|card| card.validate_inputs(&inputs).map(|inputs| (card, inputs)));

        let (card, inputs) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.log_rejected(card_name, &e);
                return Err(e);
            }
        };

        let result = self.run(&card, inputs, cancel).await;
        match &result {
            Ok(dossier) => {
                if let Some(log) = &self.audit_log {
                    if let Err(e) = log.log_run(dossier) {
                        warn!(error = %e, "Failed to write run audit record");
                    }
                }
            }
            Err(e) => self.log_rejected(card_name, e),
        }
        result
    }

    /// Verify every literal backend id and policy name in `card` is known.
    pub fn preflight(&self, card: &Card) -> Result<(), EngineError> {
        card.check_against(&self.components.registry, &self.components.policy)
    }

    fn log_rejected(&self, card_name: &str, error: &EngineError) {
        if let Some(log) = &self.audit_log {
            if let Err(e) = log.log_rejected(card_name, &error.to_body()) {
                warn!(error = %e, "Failed to write run audit record");
            }
        }
    }

    async fn run(
        &self,
        card: &Card,
        inputs: Value,
        cancel: &CancellationToken,
    ) -> Result<Dossier, EngineError> {
        let run_id = RunId::new();
        let started_at = Utc::now();
        let start = Instant::now();

        METRICS.inc_runs_started();
        info!(
            event = events::CARD_START,
            run_id = %run_id,
            card = %card.name,
            steps = card.steps.len(),
            "Card run started"
        );

        let mut ctx = ExecutionContext::new(inputs.clone());
        let mut audit: Vec<AuditEntry> = Vec::with_capacity(card.steps.len());
        let mut status = RunStatus::Completed;
        let mut error = None;
        let mut output = Value::Null;

        for step in &card.steps {
            if cancel.is_cancelled() {
                status = RunStatus::Failed;
                error = Some(
                    EngineError::Execution {
                        step: Some(step.id.clone()),
                        detail: CANCELLED_BY_CALLER_MESSAGE.to_string(),
                    }
                    .to_body(),
                );
                warn!(run_id = %run_id, step = %step.id, "Card run cancelled");
                break;
            }

            let step_started_at = Utc::now();
            let step_start = Instant::now();
            let result = self.run_step(step, &mut ctx).await;
            let duration_ms = step_start.elapsed().as_millis() as u64;

            let mut entry = AuditEntry {
                step: step.id.clone(),
                kind: step.kind,
                target: step.target.as_str().to_string(),
                outcome: StepOutcome::Ok,
                started_at: step_started_at,
                duration_ms,
                detail: None,
                candidates: None,
            };

            match result {
                Ok(out) => {
                    entry.detail = out.detail;
                    entry.candidates = out.candidates;
                    ctx.record_output(&step.id, out.value.clone());
                    output = out.value;

                    if let Some(halt) = out.halt {
                        entry.outcome = StepOutcome::Blocked;
                        METRICS.record_step(StepOutcome::Blocked, step_start);
                        audit.push(entry);
                        status = RunStatus::Blocked;
                        error = Some(halt.to_body());
                        break;
                    }

                    METRICS.record_step(StepOutcome::Ok, step_start);
                    info!(
                        event = events::STEP_COMPLETE,
                        run_id = %run_id,
                        step = %step.id,
                        duration_ms,
                        "Step complete"
                    );
                    audit.push(entry);
                }
                Err(e) => {
                    let e = e.at(&step.id);
                    METRICS.record_step(StepOutcome::Failed, step_start);
                    warn!(
                        event = events::STEP_FAIL,
                        run_id = %run_id,
                        step = %step.id,
                        required = step.required,
                        error = %e,
                        "Step failed"
                    );

                    if e.kind() == ErrorKind::ConfigError {
                        METRICS.record_run(RunStatus::Failed);
                        return Err(e);
                    }

                    entry.outcome = StepOutcome::Failed;
                    entry.detail = Some(e.to_string());
                    audit.push(entry);

                    if step.required {
                        status = RunStatus::Failed;
                        error = Some(e.to_body());
                        output = Value::Null;
                        break;
                    }
                    ctx.record_output(&step.id, Value::Null);
                    output = Value::Null;
                }
            }
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        METRICS.record_run(status);

        let event = match status {
            RunStatus::Completed => events::CARD_COMPLETE,
            RunStatus::Blocked => events::CARD_BLOCKED,
            RunStatus::Failed => events::CARD_FAIL,
        };
        info!(
            event,
            run_id = %run_id,
            card = %card.name,
            status = %status,
            steps_run = audit.len(),
            duration_ms,
            "Card run finished"
        );

        Ok(Dossier {
            run_id,
            card: card.name.clone(),
            version: card.version.clone(),
            inputs,
            output,
            status,
            error,
            audit,
            evidence: ctx.into_evidence(),
            started_at,
            duration_ms,
        })
    }

    async fn run_step(
        &self,
        step: &Step,
        ctx: &mut ExecutionContext,
    ) -> Result<StepOutput, EngineError> {
        match step.target {
            Target::EvidenceGround => self.evidence_ground(step, ctx).await,
            Target::EvidenceSnapshot => self.evidence_snapshot(step, ctx).await,
            Target::EvidenceWriteback => self.evidence_writeback(step, ctx).await,
            Target::Router => self.dispatch(step, ctx).await,
            Target::Policy => self.gate(step, ctx),
            Target::Dossier => compose(step, ctx),
        }
    }

    // =========================================================================
    // Retrieve
    // =========================================================================

    async fn evidence_ground(
        &self,
        step: &Step,
        ctx: &mut ExecutionContext,
    ) -> Result<StepOutput, EngineError> {
        let query = text_arg(step, ctx, "query")?;
        let top_k = match optional_arg(step, ctx, "top_k")? {
            Some(value) => positive_int(&value, "top_k")? as usize,
            None => DEFAULT_TOP_K,
        };
        let space = optional_text_arg(step, ctx, "space")?;

        let grounding = self
            .evidence
            .evidence_ground(&query, top_k, space.as_deref())
            .await
            .map_err(|e| EngineError::execution(e.to_string()))?;
        METRICS.inc_evidence_grounds();
        info!(
            event = events::EVIDENCE_GROUND,
            step = %step.id,
            documents = grounding.documents.len(),
            coverage = grounding.coverage,
            "Grounded query"
        );

        ctx.add_evidence(&grounding.documents);
        let detail = format!(
            "{} documents, coverage {:.2}",
            grounding.documents.len(),
            grounding.coverage
        );
        Ok(StepOutput::new(to_value(&grounding)?).detail(detail))
    }

    async fn evidence_snapshot(
        &self,
        step: &Step,
        ctx: &mut ExecutionContext,
    ) -> Result<StepOutput, EngineError> {
        let space = text_arg(step, ctx, "space")?;
        let documents = self
            .evidence
            .evidence_snapshot(&space)
            .await
            .map_err(|e| EngineError::execution(e.to_string()))?;

        ctx.add_evidence(&documents);
        let detail = format!("{} documents in '{}'", documents.len(), space);
        Ok(StepOutput::new(json!({ "space": space, "documents": to_value(&documents)? })).detail(detail))
    }

    async fn evidence_writeback(
        &self,
        step: &Step,
        ctx: &mut ExecutionContext,
    ) -> Result<StepOutput, EngineError> {
        let raw = resolve_arg(step, ctx, "documents")?;
        let raw = match raw {
            Value::Array(_) => raw,
            Value::Object(_) => Value::Array(vec![raw]),
            other => {
                return Err(EngineError::execution(format!(
                    "documents must be a list of {{space, content}} objects, got {}",
                    json_type_name(&other)
                )))
            }
        };
        let documents: Vec<NewDocument> = serde_json::from_value(raw)
            .map_err(|e| EngineError::execution(format!("invalid documents: {}", e)))?;

        let ids = self
            .evidence
            .evidence_writeback_many(&documents)
            .await
            .map_err(|e| EngineError::execution(e.to_string()))?;
        METRICS.add_evidence_writes(ids.len() as u64);
        info!(
            event = events::EVIDENCE_WRITEBACK,
            step = %step.id,
            written = ids.len(),
            submitted = documents.len(),
            "Evidence written"
        );

        let detail = format!("{} of {} documents written", ids.len(), documents.len());
        Ok(StepOutput::new(json!({ "written": ids.len(), "ids": ids })).detail(detail))
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    async fn dispatch(
        &self,
        step: &Step,
        ctx: &mut ExecutionContext,
    ) -> Result<StepOutput, EngineError> {
        let task = text_arg(step, ctx, "task")?;
        let backends = string_list_arg(step, ctx, "backends")?;
        let reference = optional_text_arg(step, ctx, "reference")?.unwrap_or_else(|| task.clone());
        let timeout = match optional_arg(step, ctx, "timeout_ms")? {
            Some(value) => Duration::from_millis(positive_int(&value, "timeout_ms")?),
            None => self.components.router.timeout(),
        };
        let min_score = match optional_arg(step, ctx, "min_score")? {
            Some(value) => Some(value.as_f64().ok_or_else(|| {
                EngineError::execution(format!(
                    "min_score must be a number, got {}",
                    json_type_name(&value)
                ))
            })?),
            None => None,
        };

        let candidates = self
            .components
            .router
            .dispatch_with_timeout(&task, &backends, timeout)
            .await?;
        let summaries: Vec<CandidateSummary> = candidates.iter().map(|c| c.summary()).collect();
        info!(
            event = events::BACKEND_CALL,
            step = %step.id,
            backends = candidates.len(),
            failed = candidates.iter().filter(|c| !c.is_viable()).count(),
            "Dispatch finished"
        );

        let rubric = Rubric::new(self.components.weights).with_reference(reference);
        let judgement = self
            .components
            .arbiter
            .adjudicate(&candidates, &rubric)
            .map_err(|e| match e {
                EngineError::Execution { step, detail } => EngineError::Execution {
                    step,
                    detail: format!("{} ({})", detail, failure_summary(&summaries)),
                },
                other => other,
            })?;

        if let Some(min) = min_score {
            let score = judgement.winning_score();
            if score < min {
                return Err(EngineError::execution(format!(
                    "winning score {:.4} from '{}' is below min_score {:.4}",
                    score, judgement.winner, min
                )));
            }
        }

        let detail = format!(
            "winner {} ({:.4})",
            judgement.winner,
            judgement.winning_score()
        );
        let mut out = StepOutput::new(to_value(&judgement)?).detail(detail);
        out.candidates = Some(summaries);
        Ok(out)
    }

    // =========================================================================
    // Gate
    // =========================================================================

    fn gate(&self, step: &Step, ctx: &mut ExecutionContext) -> Result<StepOutput, EngineError> {
        let subject = resolve_arg(step, ctx, "subject")?;
        let policies = string_list_arg(step, ctx, "policies")?;
        let halt_on: Vec<Verdict> = match optional_arg(step, ctx, "halt_on")? {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| EngineError::execution(format!("invalid halt_on: {}", e)))?,
            None => Vec::new(),
        };

        let result = self.components.policy.enforce(&subject, &policies)?;
        info!(
            event = events::POLICY_ENFORCE,
            step = %step.id,
            verdict = %result.verdict,
            violations = result.violations.len(),
            "Policy enforced"
        );

        let detail = format!(
            "verdict {}, {} violations",
            result.verdict,
            result.violations.len()
        );
        let halt = if result.is_blocked() || halt_on.contains(&result.verdict) {
            let policy = result
                .violations
                .last()
                .and_then(|v| v.split(':').next())
                .or_else(|| policies.first().map(String::as_str))
                .unwrap_or_default()
                .to_string();
            Some(EngineError::PolicyBlocked {
                step: Some(step.id.clone()),
                policy,
                violations: result.violations.clone(),
            })
        } else {
            None
        };

        let mut out = StepOutput::new(to_value(&result)?).detail(detail);
        out.halt = halt;
        Ok(out)
    }
}

// =============================================================================
// Compose
// =============================================================================

fn compose(step: &Step, ctx: &mut ExecutionContext) -> Result<StepOutput, EngineError> {
    let mut report = serde_json::Map::new();
    for (name, arg) in &step.args {
        report.insert(name.clone(), ctx.resolve(arg)?);
    }
    let detail = format!("{} fields", report.len());
    Ok(StepOutput::new(Value::Object(report)).detail(detail))
}

// =============================================================================
// Argument helpers
// =============================================================================

fn resolve_arg(step: &Step, ctx: &ExecutionContext, name: &str) -> Result<Value, EngineError> {
    let arg: &ArgValue = step
        .arg(name)
        .ok_or_else(|| EngineError::execution(format!("missing argument '{}'", name)))?;
    ctx.resolve(arg)
}

fn optional_arg(
    step: &Step,
    ctx: &ExecutionContext,
    name: &str,
) -> Result<Option<Value>, EngineError> {
    match step.arg(name) {
        Some(arg) => match ctx.resolve(arg)? {
            Value::Null => Ok(None),
            value => Ok(Some(value)),
        },
        None => Ok(None),
    }
}

fn as_text(value: Value, name: &str) -> Result<String, EngineError> {
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(EngineError::execution(format!(
            "argument '{}' must be a string, got {}",
            name,
            json_type_name(&other)
        ))),
    }
}

fn text_arg(step: &Step, ctx: &ExecutionContext, name: &str) -> Result<String, EngineError> {
    as_text(resolve_arg(step, ctx, name)?, name)
}

fn optional_text_arg(
    step: &Step,
    ctx: &ExecutionContext,
    name: &str,
) -> Result<Option<String>, EngineError> {
    optional_arg(step, ctx, name)?
        .map(|v| as_text(v, name))
        .transpose()
}

fn string_list_arg(
    step: &Step,
    ctx: &ExecutionContext,
    name: &str,
) -> Result<Vec<String>, EngineError> {
    let value = resolve_arg(step, ctx, name)?;
    let bad = |found: &Value| {
        EngineError::execution(format!(
            "argument '{}' must be a list of strings, got {}",
            name,
            json_type_name(found)
        ))
    };
    match &value {
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_str().map(str::to_string).ok_or_else(|| bad(item)))
            .collect(),
        Value::String(s) => Ok(vec![s.clone()]),
        other => Err(bad(other)),
    }
}

fn positive_int(value: &Value, name: &str) -> Result<u64, EngineError> {
    value
        .as_u64()
        .filter(|n| *n > 0)
        .ok_or_else(|| EngineError::execution(format!("argument '{}' must be a positive integer", name)))
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, EngineError> {
    serde_json::to_value(value).map_err(|e| EngineError::execution(e.to_string()))
}

fn failure_summary(candidates: &[CandidateSummary]) -> String {
    candidates
        .iter()
        .map(|c| {
            format!(
                "{}: {}",
                c.backend_id,
                c.error.as_deref().unwrap_or("ok")
            )
        })
        .collect::<Vec<_>>()
        .join("; ")
}
