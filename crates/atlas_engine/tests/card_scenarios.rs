//! End-to-end card runs against a real evidence store.

use atlas_db::AtlasDb;
use atlas_engine::{
    AuditLog, CancellationToken, Card, CardCatalog, CardExecutor, Components, EngineConfig,
};
use atlas_protocol::{EngineError, ErrorKind, NewDocument, RunStatus, StepOutcome, Verdict};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;

const QBR: &str = r#"
name = "QBR"
version = "1.0"

[inputs.accounts]
type = "list"

[inputs.time_window]
type = "string"

[[steps]]
id = "ground"
kind = "retrieve"
target = "evidence.ground"
args = { query = "KPIs for ${inputs.accounts} ${inputs.time_window}", top_k = 5, space = "kpi" }

[[steps]]
id = "summarise"
kind = "dispatch"
target = "router"
args = { task = "Summarise KPI performance: ${ground.answer}", backends = ["local_echo", "local_reverse"] }

[[steps]]
id = "gate"
kind = "gate"
target = "policy"
args = { subject = "${summarise.payload}", policies = ["no_pii"] }

[[steps]]
id = "report"
kind = "compose"
target = "dossier"
args = { summary = "${gate.redacted_payload}", winner = "${summarise.winner}", accounts = "${inputs.accounts}" }
"#;

const ENGINE_CONFIG: &str = r#"
[router]
timeout_ms = 5000

[[backends]]
id = "slow"
kind = "static"
payload = "too late"
delay_ms = 10000

[[backends]]
id = "measured"
kind = "static"
payload = "steady answer"
delay_ms = 300

[[backends]]
id = "flaky"
kind = "failing"
message = "quota exceeded"

[[policies]]
name = "no_confidential"
rules = [{ id = "marker", action = "block", pattern = "(?i)confidential" }]

[[policies]]
name = "strict_pii"
report_redactions = true
rules = [{ id = "email", action = "redact", detector = "email" }]
"#;

struct Harness {
    executor: CardExecutor,
    db: AtlasDb,
    temp: TempDir,
}

async fn harness(cards: &[&str]) -> Harness {
    let temp = TempDir::new().unwrap();
    let db = AtlasDb::open(temp.path().join("atlas.sqlite3")).await.unwrap();
    let config = EngineConfig::from_toml_str(ENGINE_CONFIG).unwrap();
    let components = Components::from_config(&config).unwrap();
    let catalog = CardCatalog::from_cards(
        cards
            .iter()
            .map(|text| Card::from_toml_str(text).unwrap()),
    )
    .unwrap();
    Harness {
        executor: CardExecutor::new(catalog, components, db.clone()),
        db,
        temp,
    }
}

fn qbr_inputs() -> Value {
    json!({"accounts": ["ACME"], "time_window": "Q3"})
}

// ============================================================================
// Happy path
// ============================================================================

#[tokio::test]
async fn test_qbr_completes_with_best_candidate() {
    let h = harness(&[QBR]).await;
    h.db.evidence_writeback(&NewDocument::new("kpi", "ACME Q3 revenue grew 12%"))
        .await
        .unwrap();

    let dossier = h.executor.execute("QBR", qbr_inputs()).await.unwrap();

    assert_eq!(dossier.status, RunStatus::Completed);
    assert!(dossier.error.is_none());
    assert_eq!(
        dossier.audited_steps(),
        vec!["ground", "summarise", "gate", "report"]
    );
    assert!(dossier.audit.iter().all(|e| e.outcome == StepOutcome::Ok));

    // echo reproduces the task verbatim, so it beats reverse on faithfulness
    assert_eq!(dossier.output["winner"], "local_echo");
    assert_eq!(
        dossier.output["summary"],
        "Summarise KPI performance: ACME Q3 revenue grew 12%"
    );
    assert_eq!(dossier.output["accounts"], json!(["ACME"]));

    assert_eq!(dossier.evidence.len(), 1);
    assert_eq!(dossier.evidence[0].content, "ACME Q3 revenue grew 12%");
}

#[tokio::test]
async fn test_audit_lists_every_candidate() {
    let h = harness(&[QBR]).await;
    let dossier = h.executor.execute("QBR", qbr_inputs()).await.unwrap();

    let dispatch = &dossier.audit[1];
    let candidates = dispatch.candidates.as_ref().unwrap();
    let ids: Vec<_> = candidates.iter().map(|c| c.backend_id.as_str()).collect();
    assert_eq!(ids, vec!["local_echo", "local_reverse"]);
    assert!(candidates.iter().all(|c| c.error.is_none()));
}

#[tokio::test]
async fn test_empty_evidence_still_completes() {
    let h = harness(&[QBR]).await;
    let dossier = h.executor.execute("QBR", qbr_inputs()).await.unwrap();
    assert_eq!(dossier.status, RunStatus::Completed);
    assert!(dossier.evidence.is_empty());
    assert_eq!(
        dossier.audit[0].detail.as_deref(),
        Some("0 documents, coverage 0.00")
    );
}

#[tokio::test]
async fn test_same_inputs_same_outputs() {
    let h = harness(&[QBR]).await;
    h.db.evidence_writeback(&NewDocument::new("kpi", "ACME churn fell"))
        .await
        .unwrap();

    let a = h.executor.execute("QBR", qbr_inputs()).await.unwrap();
    let b = h.executor.execute("QBR", qbr_inputs()).await.unwrap();

    assert_ne!(a.run_id, b.run_id);
    assert_eq!(a.output, b.output);
    assert_eq!(a.status, b.status);
    let outcomes = |d: &atlas_protocol::Dossier| {
        d.audit
            .iter()
            .map(|e| (e.step.clone(), e.outcome))
            .collect::<Vec<_>>()
    };
    assert_eq!(outcomes(&a), outcomes(&b));
}

// ============================================================================
// Dispatch edge cases
// ============================================================================

#[tokio::test]
async fn test_backend_timeout_does_not_fail_step() {
    let card = r#"
name = "Race"
[[steps]]
id = "ask"
kind = "dispatch"
target = "router"
args = { task = "Summarise", backends = ["local_echo", "slow"], timeout_ms = 100 }
"#;
    let h = harness(&[card]).await;
    let dossier = h.executor.execute("Race", json!({})).await.unwrap();

    assert_eq!(dossier.status, RunStatus::Completed);
    assert_eq!(dossier.output["winner"], "local_echo");
    assert_eq!(dossier.output["scores"]["slow"], 0.0);

    let candidates = dossier.audit[0].candidates.as_ref().unwrap();
    let slow = candidates.iter().find(|c| c.backend_id == "slow").unwrap();
    assert!(slow.error.as_deref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_unknown_backend_is_config_error_without_dossier() {
    let card = r#"
name = "Ghost"
[[steps]]
id = "ask"
kind = "dispatch"
target = "router"
args = { task = "hi", backends = ["local_echo", "gpt_imaginary"] }
"#;
    let h = harness(&[card]).await;
    let err = h.executor.execute("Ghost", json!({})).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ConfigError);
    assert_eq!(
        err,
        EngineError::UnknownBackend {
            backend: "gpt_imaginary".into(),
            step: Some("ask".into())
        }
    );
}

#[tokio::test]
async fn test_min_score_threshold_fails_required_step() {
    let card = r#"
name = "Picky"
[[steps]]
id = "ask"
kind = "dispatch"
target = "router"
args = { task = "hi", backends = ["local_echo"], min_score = 1.5 }

[[steps]]
id = "out"
kind = "compose"
target = "dossier"
args = { answer = "${ask.payload}" }
"#;
    let h = harness(&[card]).await;
    let dossier = h.executor.execute("Picky", json!({})).await.unwrap();

    assert_eq!(dossier.status, RunStatus::Failed);
    let error = dossier.error.as_ref().unwrap();
    assert_eq!(error.error, ErrorKind::ExecutionError);
    assert_eq!(error.step.as_deref(), Some("ask"));
    assert!(error.detail.contains("below min_score"));
    assert_eq!(dossier.audited_steps(), vec!["ask"]);
}

// ============================================================================
// Policy gate
// ============================================================================

#[tokio::test]
async fn test_pii_is_redacted_but_passes() {
    let h = harness(&[QBR]).await;
    h.db.evidence_writeback(&NewDocument::new(
        "kpi",
        "ACME Q3 owner is jane.doe@acme.com",
    ))
    .await
    .unwrap();

    let dossier = h.executor.execute("QBR", qbr_inputs()).await.unwrap();
    assert_eq!(dossier.status, RunStatus::Completed);

    let summary = dossier.output["summary"].as_str().unwrap();
    assert!(summary.contains("[REDACTED]"));
    assert!(!summary.contains("jane.doe@acme.com"));
    assert_eq!(dossier.audit[2].detail.as_deref(), Some("verdict pass, 1 violations"));
}

const GATED: &str = r#"
name = "Gated"
[inputs.text]
type = "string"

[[steps]]
id = "check"
kind = "gate"
target = "policy"
args = { subject = "${inputs.text}", policies = ["no_confidential"] }

[[steps]]
id = "ask"
kind = "dispatch"
target = "router"
args = { task = "${check.redacted_payload}", backends = ["local_echo"] }

[[steps]]
id = "out"
kind = "compose"
target = "dossier"
args = { answer = "${ask.payload}" }
"#;

#[tokio::test]
async fn test_blocked_verdict_truncates_audit() {
    let h = harness(&[GATED]).await;
    let dossier = h
        .executor
        .execute("Gated", json!({"text": "CONFIDENTIAL board notes"}))
        .await
        .unwrap();

    assert_eq!(dossier.status, RunStatus::Blocked);
    assert_eq!(dossier.audited_steps(), vec!["check"]);
    assert_eq!(dossier.audit[0].outcome, StepOutcome::Blocked);

    let error = dossier.error.unwrap();
    assert_eq!(error.error, ErrorKind::PolicyBlocked);
    assert_eq!(error.step.as_deref(), Some("check"));
    assert!(error.detail.contains("no_confidential:marker"));

    assert_eq!(dossier.output["verdict"], "blocked");
    assert!(dossier.output.get("redacted_payload").is_none());
}

#[tokio::test]
async fn test_clean_subject_passes_gate() {
    let h = harness(&[GATED]).await;
    let dossier = h
        .executor
        .execute("Gated", json!({"text": "public roadmap"}))
        .await
        .unwrap();
    assert_eq!(dossier.status, RunStatus::Completed);
    assert_eq!(dossier.output["answer"], "public roadmap");
}

#[tokio::test]
async fn test_halt_on_redacted() {
    let card = r#"
name = "Strict"
[inputs.text]
type = "string"

[[steps]]
id = "check"
kind = "gate"
target = "policy"
args = { subject = "${inputs.text}", policies = ["strict_pii"], halt_on = ["redacted"] }

[[steps]]
id = "out"
kind = "compose"
target = "dossier"
args = { text = "${check.redacted_payload}" }
"#;
    let h = harness(&[card]).await;

    let halted = h
        .executor
        .execute("Strict", json!({"text": "mail ops@acme.com"}))
        .await
        .unwrap();
    assert_eq!(halted.status, RunStatus::Blocked);
    assert_eq!(halted.output["verdict"], Verdict::Redacted.as_str());
    assert_eq!(halted.audited_steps(), vec!["check"]);

    let clean = h
        .executor
        .execute("Strict", json!({"text": "no contact details"}))
        .await
        .unwrap();
    assert_eq!(clean.status, RunStatus::Completed);
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_optional_step_failure_continues() {
    let card = r#"
name = "BestEffort"
[inputs.topic]
type = "string"

[[steps]]
id = "extra"
kind = "dispatch"
target = "router"
required = false
args = { task = "${inputs.topic}", backends = ["flaky"] }

[[steps]]
id = "out"
kind = "compose"
target = "dossier"
args = { topic = "${inputs.topic}" }
"#;
    let h = harness(&[card]).await;
    let dossier = h
        .executor
        .execute("BestEffort", json!({"topic": "renewals"}))
        .await
        .unwrap();

    assert_eq!(dossier.status, RunStatus::Completed);
    assert_eq!(dossier.audit[0].outcome, StepOutcome::Failed);
    assert!(dossier.audit[0]
        .detail
        .as_deref()
        .unwrap()
        .contains("no viable candidate"));
    assert_eq!(dossier.audit[1].outcome, StepOutcome::Ok);
    assert_eq!(dossier.output, json!({"topic": "renewals"}));
}

#[tokio::test]
async fn test_required_step_failure_aborts() {
    let card = r#"
name = "MustAnswer"
[[steps]]
id = "ask"
kind = "dispatch"
target = "router"
args = { task = "hi", backends = ["flaky"] }

[[steps]]
id = "out"
kind = "compose"
target = "dossier"
args = { answer = "${ask.payload}" }
"#;
    let h = harness(&[card]).await;
    let dossier = h.executor.execute("MustAnswer", json!({})).await.unwrap();

    assert_eq!(dossier.status, RunStatus::Failed);
    assert_eq!(dossier.audited_steps(), vec!["ask"]);
    assert_eq!(dossier.output, Value::Null);
    let error = dossier.error.unwrap();
    assert_eq!(error.step.as_deref(), Some("ask"));
    assert!(error.detail.contains("flaky: quota exceeded"));
}

#[tokio::test]
async fn test_validation_error_names_field() {
    let h = harness(&[QBR]).await;

    let err = h
        .executor
        .execute("QBR", json!({"accounts": ["ACME"]}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);
    assert_eq!(err.to_body().field.as_deref(), Some("time_window"));

    let err = h
        .executor
        .execute("QBR", json!({"accounts": "ACME", "time_window": "Q3"}))
        .await
        .unwrap_err();
    assert_eq!(err.to_body().field.as_deref(), Some("accounts"));
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let h = harness(&[QBR]).await;
    let token = CancellationToken::new();
    token.cancel();

    let dossier = h
        .executor
        .execute_with_cancel("QBR", qbr_inputs(), &token)
        .await
        .unwrap();

    assert_eq!(dossier.status, RunStatus::Failed);
    assert!(dossier.audit.is_empty());
    let error = dossier.error.unwrap();
    assert_eq!(error.step.as_deref(), Some("ground"));
    assert!(error.detail.contains("Cancelled by caller"));
}

const PAUSED: &str = r#"
name = "Paused"
[inputs.text]
type = "string"

[[steps]]
id = "ask"
kind = "dispatch"
target = "router"
args = { task = "${inputs.text}", backends = ["measured"] }

[[steps]]
id = "gate"
kind = "gate"
target = "policy"
args = { subject = "${ask.payload}", policies = ["allow_all"] }

[[steps]]
id = "report"
kind = "compose"
target = "dossier"
args = { answer = "${gate.redacted_payload}" }
"#;

#[tokio::test]
async fn test_cancel_mid_run_finishes_current_step_only() {
    let h = harness(&[PAUSED]).await;
    let token = CancellationToken::new();

    let cancelled = {
        let executor = h.executor.clone();
        let token = token.clone();
        tokio::spawn(async move {
            executor
                .execute_with_cancel("Paused", json!({"text": "first"}), &token)
                .await
        })
    };
    let untouched = {
        let executor = h.executor.clone();
        tokio::spawn(async move { executor.execute("Paused", json!({"text": "second"})).await })
    };

    // both runs are now waiting on the 300ms backend
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    token.cancel();

    let dossier = cancelled.await.unwrap().unwrap();
    assert_eq!(dossier.status, RunStatus::Failed);
    assert_eq!(dossier.audited_steps(), vec!["ask"]);
    assert_eq!(dossier.audit[0].outcome, StepOutcome::Ok);
    assert!(dossier.audit[0]
        .detail
        .as_deref()
        .unwrap()
        .starts_with("winner measured"));
    let error = dossier.error.unwrap();
    assert_eq!(error.step.as_deref(), Some("gate"));
    assert!(error.detail.contains("Cancelled by caller"));

    let other = untouched.await.unwrap().unwrap();
    assert_eq!(other.status, RunStatus::Completed);
    assert_eq!(other.audited_steps(), vec!["ask", "gate", "report"]);
    assert_eq!(other.output["answer"], "steady answer");
}

#[tokio::test]
async fn test_runtime_duplicate_backends_rejected() {
    let card = r#"
name = "Dynamic"
[inputs.models]
type = "list"

[[steps]]
id = "ask"
kind = "dispatch"
target = "router"
args = { task = "ACME revenue", backends = "${inputs.models}", min_score = 0.1 }
"#;
    let h = harness(&[card]).await;

    let err = h
        .executor
        .execute("Dynamic", json!({"models": ["local_echo", "flaky", "local_echo"]}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigError);
    assert!(err.to_string().contains("'local_echo' requested more than once"));

    let dossier = h
        .executor
        .execute("Dynamic", json!({"models": ["local_echo", "flaky"]}))
        .await
        .unwrap();
    assert_eq!(dossier.status, RunStatus::Completed);
    assert!(dossier.output["scores"]["local_echo"].as_f64().unwrap() > 0.1);
}

// ============================================================================
// Evidence steps & run log
// ============================================================================

#[tokio::test]
async fn test_writeback_then_ground_in_one_card() {
    let card = r#"
name = "Learn"
[inputs.note]
type = "string"

[[steps]]
id = "save"
kind = "retrieve"
target = "evidence.writeback"
args = { documents = [{ space = "notes", content = "${inputs.note}" }] }

[[steps]]
id = "recall"
kind = "retrieve"
target = "evidence.snapshot"
args = { space = "notes" }
"#;
    let h = harness(&[card]).await;
    let dossier = h
        .executor
        .execute("Learn", json!({"note": "ACME renewal is in March"}))
        .await
        .unwrap();

    assert_eq!(dossier.status, RunStatus::Completed);
    assert_eq!(dossier.audit[0].detail.as_deref(), Some("1 of 1 documents written"));
    assert_eq!(dossier.output["space"], "notes");
    assert_eq!(
        dossier.output["documents"][0]["content"],
        "ACME renewal is in March"
    );
    assert_eq!(h.db.evidence_count(Some("notes")).await.unwrap(), 1);
}

#[tokio::test]
async fn test_concurrent_runs_are_isolated() {
    let h = harness(&[GATED]).await;
    let executor = h.executor.clone();

    let mut handles = Vec::new();
    for i in 0..8 {
        let executor = executor.clone();
        handles.push(tokio::spawn(async move {
            let text = format!("note {}", i);
            let dossier = executor
                .execute("Gated", json!({ "text": text.clone() }))
                .await
                .unwrap();
            (text, dossier)
        }));
    }
    for handle in handles {
        let (text, dossier) = handle.await.unwrap();
        assert_eq!(dossier.output["answer"], Value::String(text));
    }
}

#[tokio::test]
async fn test_run_log_records_runs_and_rejections() {
    let h = harness(&[GATED]).await;
    let path = h.temp.path().join("runs.ndjson");
    let executor = h
        .executor
        .clone()
        .with_audit_log(Arc::new(AuditLog::open(&path).unwrap()));

    executor
        .execute("Gated", json!({"text": "hello"}))
        .await
        .unwrap();
    executor.execute("Gated", json!({})).await.unwrap_err();

    let content = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<Value> = content
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["type"], "run");
    assert_eq!(lines[0]["status"], "completed");
    assert_eq!(lines[1]["type"], "rejected");
    assert_eq!(lines[1]["error"]["error"], "validation_error");
}
