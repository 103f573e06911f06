//! HTTP contract tests driving the router in-process.

use atlas_db::AtlasDb;
use atlas_engine::{Card, CardCatalog, CardExecutor, Components, EngineConfig};
use atlas_server::{router, HttpConfig};
use axum::body::Body;
use http_body_util::BodyExt;
use hyper::{Request, StatusCode};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

const SUMMARY_CARD: &str = r#"
name = "Summary"
description = "Summarise a note"

[inputs.note]
type = "string"

[[steps]]
id = "ask"
kind = "dispatch"
target = "router"
args = { task = "${inputs.note}", backends = ["local_echo", "local_reverse"] }

[[steps]]
id = "gate"
kind = "gate"
target = "policy"
args = { subject = "${ask.payload}", policies = ["no_pii", "no_confidential"] }

[[steps]]
id = "report"
kind = "compose"
target = "dossier"
args = { summary = "${gate.redacted_payload}" }
"#;

const BROKEN_CARD: &str = r#"
name = "Broken"

[[steps]]
id = "ask"
kind = "dispatch"
target = "router"
args = { task = "hi", backends = ["flaky"] }
"#;

const CONFIG: &str = r#"
[[backends]]
id = "flaky"
kind = "failing"

[[policies]]
name = "no_confidential"
rules = [{ id = "marker", action = "block", pattern = "(?i)confidential" }]
"#;

async fn app_with(config: HttpConfig) -> (axum::Router, TempDir) {
    let temp = TempDir::new().unwrap();
    let db = AtlasDb::open(temp.path().join("atlas.sqlite3")).await.unwrap();
    let components =
        Components::from_config(&EngineConfig::from_toml_str(CONFIG).unwrap()).unwrap();
    let catalog = CardCatalog::from_cards(vec![
        Card::from_toml_str(SUMMARY_CARD).unwrap(),
        Card::from_toml_str(BROKEN_CARD).unwrap(),
    ])
    .unwrap();
    let executor = CardExecutor::new(catalog, components, db);
    (router(executor, config), temp)
}

async fn app() -> (axum::Router, TempDir) {
    app_with(HttpConfig::default()).await
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

// ============================================================================
// Operational
// ============================================================================

#[tokio::test]
async fn test_healthz_and_metrics() {
    let (app, _temp) = app().await;

    let response = app.clone().oneshot(get("/healthz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"ok");

    let response = app.clone().oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("atlas_runs_started_total"));
}

#[tokio::test]
async fn test_healthz_reports_closed_store() {
    let temp = TempDir::new().unwrap();
    let db = AtlasDb::open(temp.path().join("atlas.sqlite3")).await.unwrap();
    let components =
        Components::from_config(&EngineConfig::from_toml_str(CONFIG).unwrap()).unwrap();
    let catalog = CardCatalog::from_cards(Vec::new()).unwrap();
    let executor = CardExecutor::new(catalog, components, db.clone());
    let app = router(executor, HttpConfig::default());

    db.close().await;

    let response = app.oneshot(get("/healthz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

// ============================================================================
// Cards
// ============================================================================

#[tokio::test]
async fn test_list_and_show_cards() {
    let (app, _temp) = app().await;

    let (status, body) = send(&app, get("/v1/cards")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["name"], "Broken");
    assert_eq!(body[1]["name"], "Summary");
    assert_eq!(body[1]["steps"], 3);

    let (status, body) = send(&app, get("/v1/cards/Summary")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["steps"][0]["args"]["task"], "${inputs.note}");

    let (status, body) = send(&app, get("/v1/cards/Missing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "config_error");
}

#[tokio::test]
async fn test_run_card_completed() {
    let (app, _temp) = app().await;
    let (status, body) = send(
        &app,
        post_json("/v1/cards/Summary", json!({"note": "email bob@example.com today"})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["output"]["summary"], "email [REDACTED] today");
    assert_eq!(body["audit"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_run_card_blocked_is_200() {
    let (app, _temp) = app().await;
    let (status, body) = send(
        &app,
        post_json("/v1/cards/Summary", json!({"note": "Confidential forecast"})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "blocked");
    assert_eq!(body["error"]["error"], "policy_blocked");
    assert_eq!(body["error"]["step"], "gate");
}

#[tokio::test]
async fn test_run_card_validation_is_400() {
    let (app, _temp) = app().await;
    let (status, body) = send(&app, post_json("/v1/cards/Summary", json!({"note": 42}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");
    assert_eq!(body["field"], "note");

    let request = Request::builder()
        .method("POST")
        .uri("/v1/cards/Summary")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");
}

#[tokio::test]
async fn test_run_unknown_card_is_404() {
    let (app, _temp) = app().await;
    let (status, body) = send(&app, post_json("/v1/cards/Nope", json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "config_error");
}

#[tokio::test]
async fn test_failed_run_is_500_with_dossier() {
    let (app, _temp) = app().await;
    let (status, body) = send(&app, post_json("/v1/cards/Broken", json!({}))).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "execution_error");
    assert_eq!(body["step"], "ask");
    assert_eq!(body["dossier"]["status"], "failed");
}

// ============================================================================
// Components
// ============================================================================

#[tokio::test]
async fn test_evidence_roundtrip() {
    let (app, _temp) = app().await;

    let (status, body) = send(
        &app,
        post_json(
            "/v1/evidence/writeback",
            json!({"documents": [
                {"space": "kpi", "content": "ACME revenue grew"},
                {"space": "kpi", "content": "Globex churn fell"},
                {"space": "", "content": "skipped"}
            ]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["written"], 2);

    let (status, body) = send(&app, get("/v1/evidence?q=acme%20revenue&k=1&space=kpi")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["documents"][0]["content"], "ACME revenue grew");
    assert_eq!(body["coverage"], 0.5);

    let (status, body) = send(&app, get("/v1/evidence/kpi")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 2);

    let (_, body) = send(&app, get("/v1/evidence?q=anything&space=empty")).await;
    assert_eq!(body["caveats"][0], "No evidence found in space 'empty'");
}

#[tokio::test]
async fn test_dispatch_and_adjudicate() {
    let (app, _temp) = app().await;

    let (status, candidates) = send(
        &app,
        post_json(
            "/v1/router/dispatch",
            json!({"task": "abc", "backends": ["local_reverse", "local_echo"]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(candidates[0]["backend_id"], "local_echo");
    assert_eq!(candidates[1]["payload"], "cba");

    let (status, judgement) = send(
        &app,
        post_json(
            "/v1/arbiter/adjudicate",
            json!({"candidates": candidates, "reference": "abc"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(judgement["winner"], "local_echo");

    let (status, body) = send(
        &app,
        post_json(
            "/v1/router/dispatch",
            json!({"task": "abc", "backends": ["gpt_imaginary"]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["detail"].as_str().unwrap().contains("gpt_imaginary"));
}

#[tokio::test]
async fn test_adjudicate_rejects_repeated_backend() {
    let (app, _temp) = app().await;
    let (status, body) = send(
        &app,
        post_json(
            "/v1/arbiter/adjudicate",
            json!({
                "candidates": [
                    {"backend_id": "local_echo", "payload": "abc", "latency_ms": 1},
                    {"backend_id": "local_echo", "payload": "", "latency_ms": 50, "error": "timed out"}
                ],
                "reference": "abc"
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");
    assert_eq!(body["field"], "candidates");
}

#[tokio::test]
async fn test_self_check() {
    let (app, _temp) = app().await;
    let (status, body) = send(
        &app,
        post_json(
            "/v1/arbiter/self_check",
            json!({"output": "plain answer", "checks": ["pii"]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["score"], 1.0);
}

#[tokio::test]
async fn test_policy_endpoints() {
    let (app, _temp) = app().await;

    let (status, body) = send(
        &app,
        post_json(
            "/v1/policy/enforce",
            json!({"payload": {"note": "call 555-123-4567"}, "policies": ["no_pii"]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["verdict"], "pass");
    assert_eq!(body["redacted_payload"]["note"], "call [REDACTED]");

    let (status, body) = send(
        &app,
        post_json("/v1/policy/redact", json!({"payload": ["ssn 123-45-6789"]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["redacted"], json!(["ssn [REDACTED]"]));

    let (status, body) = send(
        &app,
        post_json(
            "/v1/policy/enforce",
            json!({"payload": "x", "policies": ["nope"]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "config_error");
}

// ============================================================================
// Auth & rate limiting
// ============================================================================

#[tokio::test]
async fn test_api_key_required_when_configured() {
    let (app, _temp) = app_with(HttpConfig {
        api_key: Some("s3cret".into()),
        rate_limit_per_min: 0,
    })
    .await;

    let (status, _) = send(&app, get("/v1/cards")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri("/v1/cards")
        .header("x-api-key", "s3cret")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);

    // operational routes stay open
    let response = app.clone().oneshot(get("/healthz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_rate_limit_returns_429() {
    let (app, _temp) = app_with(HttpConfig {
        api_key: None,
        rate_limit_per_min: 2,
    })
    .await;

    assert_eq!(send(&app, get("/v1/cards")).await.0, StatusCode::OK);
    assert_eq!(send(&app, get("/v1/cards")).await.0, StatusCode::OK);

    let response = app.clone().oneshot(get("/v1/cards")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["retry-after"], "60");
}

#[tokio::test]
async fn test_rate_limit_ignores_unverified_key_header() {
    let (app, _temp) = app_with(HttpConfig {
        api_key: None,
        rate_limit_per_min: 1,
    })
    .await;

    let mut statuses = Vec::new();
    for i in 0..5 {
        let request = Request::builder()
            .uri("/v1/cards")
            .header("x-api-key", format!("rotating-{}", i))
            .body(Body::empty())
            .unwrap();
        statuses.push(send(&app, request).await.0);
    }

    assert_eq!(statuses[0], StatusCode::OK);
    assert!(statuses[1..]
        .iter()
        .all(|s| *s == StatusCode::TOO_MANY_REQUESTS));
}
