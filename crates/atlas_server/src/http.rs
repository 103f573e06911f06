//! HTTP API.
//!
//! `/healthz` and `/metrics` are open. Everything under `/v1` passes the
//! API-key check (when a key is configured) and the per-caller rate limit.
//!
//! Card runs map outcomes to status codes as follows:
//!
//! | outcome                    | status |
//! |----------------------------|--------|
//! | completed / blocked        | 200    |
//! | validation error           | 400    |
//! | unknown card               | 404    |
//! | other config error         | 500    |
//! | failed run (with Dossier)  | 500    |

use crate::rate_limit::RateLimiter;
use atlas_engine::{self_check, CardExecutor, Rubric, METRICS};
use atlas_protocol::defaults::{API_KEY_HEADER, DEFAULT_TOP_K};
use atlas_protocol::{
    Candidate, Dossier, EngineError, ErrorBody, ErrorKind, Grounding, Judgement, NewDocument,
    PolicyResult, RunStatus, SelfCheck,
};
use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct HttpConfig {
    /// Shared secret expected in `X-API-Key`; `None` disables the check.
    pub api_key: Option<String>,
    /// Requests per minute per caller; 0 disables limiting.
    pub rate_limit_per_min: u32,
}

#[derive(Clone)]
pub struct AppState {
    executor: CardExecutor,
    api_key: Option<Arc<str>>,
    rate_limiter: Option<RateLimiter>,
}

type ApiError = (StatusCode, Json<ErrorBody>);
type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(executor: CardExecutor, config: HttpConfig) -> Router {
    let state = AppState {
        executor,
        api_key: config
            .api_key
            .filter(|k| !k.is_empty())
            .map(Arc::from),
        rate_limiter: (config.rate_limit_per_min > 0)
            .then(|| RateLimiter::per_minute(config.rate_limit_per_min)),
    };

    let v1 = Router::new()
        .route("/cards", get(list_cards))
        .route("/cards/:name", get(show_card).post(run_card))
        .route("/evidence", get(evidence_ground))
        .route("/evidence/writeback", post(evidence_writeback))
        .route("/evidence/:space", get(evidence_snapshot))
        .route("/router/dispatch", post(router_dispatch))
        .route("/arbiter/adjudicate", post(arbiter_adjudicate))
        .route("/arbiter/self_check", post(arbiter_self_check))
        .route("/policy/enforce", post(policy_enforce))
        .route("/policy/redact", post(policy_redact))
        .route_layer(middleware::from_fn_with_state(state.clone(), guard));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .nest("/v1", v1)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

// ============================================================================
// Errors
// ============================================================================

/// HTTP status for an engine error.
pub fn status_for(error: &EngineError) -> StatusCode {
    if matches!(error, EngineError::UnknownCard(_)) {
        return StatusCode::NOT_FOUND;
    }
    match error.kind() {
        ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
        ErrorKind::ConfigError | ErrorKind::ExecutionError => StatusCode::INTERNAL_SERVER_ERROR,
        // never returned as an Err by the executor; only direct callers see it
        ErrorKind::PolicyBlocked => StatusCode::FORBIDDEN,
    }
}

fn api_error(error: EngineError) -> ApiError {
    (status_for(&error), Json(error.to_body()))
}

fn bad_request(detail: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            error: ErrorKind::ValidationError,
            detail: detail.into(),
            step: None,
            field: None,
        }),
    )
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| bad_request(rejection.body_text()))
}

fn internal(detail: impl std::fmt::Display) -> ApiError {
    api_error(EngineError::execution(detail.to_string()))
}

// ============================================================================
// Middleware
// ============================================================================

async fn guard(
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if let Some(expected) = &state.api_key {
        if presented.as_deref() != Some(expected.as_ref()) {
            let body = ErrorBody {
                error: ErrorKind::ValidationError,
                detail: "missing or invalid API key".to_string(),
                step: None,
                field: Some(API_KEY_HEADER.to_string()),
            };
            return (StatusCode::UNAUTHORIZED, Json(body)).into_response();
        }
    }

    if let Some(limiter) = &state.rate_limiter {
        // an unverified header must not pick its own bucket
        let verified_key = state.api_key.as_ref().and(presented.as_deref());
        let caller = match (verified_key, &connect) {
            (Some(key), _) => format!("key:{}", key),
            (None, Some(ConnectInfo(addr))) => format!("ip:{}", addr.ip()),
            (None, None) => "anonymous".to_string(),
        };
        if !limiter.check(&caller) {
            warn!(path = %request.uri().path(), "Rate limit exceeded");
            return too_many_requests(limiter.window());
        }
    }

    next.run(request).await
}

fn too_many_requests(window: Duration) -> Response {
    let body = json!({ "error": "rate_limited", "detail": "rate limit exceeded" });
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    if let Ok(value) = HeaderValue::from_str(&window.as_secs().to_string()) {
        response.headers_mut().insert(header::RETRY_AFTER, value);
    }
    response
}

// ============================================================================
// Operational
// ============================================================================

async fn healthz(State(state): State<AppState>) -> Response {
    match state.executor.evidence().ping().await {
        Ok(()) => "ok".into_response(),
        Err(err) => {
            warn!(error = %err, "Evidence store unavailable");
            (StatusCode::SERVICE_UNAVAILABLE, "evidence store unavailable").into_response()
        }
    }
}

async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        METRICS.prometheus_format(),
    )
}

// ============================================================================
// Cards
// ============================================================================

async fn list_cards(State(state): State<AppState>) -> Json<Vec<atlas_engine::CardSummary>> {
    Json(state.executor.catalog().list())
}

async fn show_card(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<atlas_engine::Card> {
    let card = state.executor.catalog().get(&name).map_err(api_error)?;
    Ok(Json(card.as_ref().clone()))
}

/// Body of a failed run: the error fields plus the partial Dossier.
#[derive(Debug, Serialize)]
struct FailedRun {
    #[serde(flatten)]
    error: ErrorBody,
    dossier: Dossier,
}

async fn run_card(
    State(state): State<AppState>,
    Path(name): Path<String>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Response {
    let inputs = match json_body(payload) {
        Ok(inputs) => inputs,
        Err(err) => return err.into_response(),
    };

    match state.executor.execute(&name, inputs).await {
        Ok(dossier) => match (dossier.status, dossier.error.clone()) {
            (RunStatus::Failed, Some(error)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(FailedRun { error, dossier }),
            )
                .into_response(),
            _ => (StatusCode::OK, Json(dossier)).into_response(),
        },
        Err(e) => api_error(e).into_response(),
    }
}

// ============================================================================
// Evidence
// ============================================================================

#[derive(Debug, Deserialize)]
struct GroundQuery {
    #[serde(default)]
    q: String,
    k: Option<usize>,
    space: Option<String>,
}

async fn evidence_ground(
    State(state): State<AppState>,
    Query(params): Query<GroundQuery>,
) -> ApiResult<Grounding> {
    let top_k = params.k.unwrap_or(DEFAULT_TOP_K);
    if top_k == 0 {
        return Err(bad_request("k must be positive"));
    }
    let grounding = state
        .executor
        .evidence()
        .evidence_ground(&params.q, top_k, params.space.as_deref())
        .await
        .map_err(internal)?;
    METRICS.inc_evidence_grounds();
    Ok(Json(grounding))
}

async fn evidence_snapshot(
    State(state): State<AppState>,
    Path(space): Path<String>,
) -> ApiResult<Vec<atlas_protocol::Document>> {
    let documents = state
        .executor
        .evidence()
        .evidence_snapshot(&space)
        .await
        .map_err(internal)?;
    Ok(Json(documents))
}

#[derive(Debug, Deserialize)]
struct WritebackRequest {
    documents: Vec<NewDocument>,
}

async fn evidence_writeback(
    State(state): State<AppState>,
    payload: Result<Json<WritebackRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let request = json_body(payload)?;
    let ids = state
        .executor
        .evidence()
        .evidence_writeback_many(&request.documents)
        .await
        .map_err(internal)?;
    METRICS.add_evidence_writes(ids.len() as u64);
    Ok(Json(json!({ "written": ids.len(), "ids": ids })))
}

// ============================================================================
// Router, arbiter, policy
// ============================================================================

#[derive(Debug, Deserialize)]
struct DispatchRequest {
    task: String,
    backends: Vec<String>,
    timeout_ms: Option<u64>,
}

async fn router_dispatch(
    State(state): State<AppState>,
    payload: Result<Json<DispatchRequest>, JsonRejection>,
) -> ApiResult<Vec<Candidate>> {
    let request = json_body(payload)?;
    let router = &state.executor.components().router;
    let timeout = request
        .timeout_ms
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
        .unwrap_or_else(|| router.timeout());
    let candidates = router
        .dispatch_with_timeout(&request.task, &request.backends, timeout)
        .await
        .map_err(api_error)?;
    Ok(Json(candidates))
}

#[derive(Debug, Deserialize)]
struct AdjudicateRequest {
    candidates: Vec<Candidate>,
    #[serde(default)]
    reference: String,
}

async fn arbiter_adjudicate(
    State(state): State<AppState>,
    payload: Result<Json<AdjudicateRequest>, JsonRejection>,
) -> ApiResult<Judgement> {
    let request = json_body(payload)?;
    let components = state.executor.components();
    let rubric = Rubric::new(components.weights).with_reference(request.reference);
    let judgement = components
        .arbiter
        .adjudicate(&request.candidates, &rubric)
        .map_err(api_error)?;
    Ok(Json(judgement))
}

#[derive(Debug, Deserialize)]
struct SelfCheckRequest {
    output: String,
    #[serde(default)]
    checks: Vec<String>,
}

async fn arbiter_self_check(
    payload: Result<Json<SelfCheckRequest>, JsonRejection>,
) -> ApiResult<SelfCheck> {
    let request = json_body(payload)?;
    Ok(Json(self_check(&request.output, &request.checks)))
}

#[derive(Debug, Deserialize)]
struct EnforceRequest {
    payload: Value,
    policies: Vec<String>,
}

async fn policy_enforce(
    State(state): State<AppState>,
    payload: Result<Json<EnforceRequest>, JsonRejection>,
) -> ApiResult<PolicyResult> {
    let request = json_body(payload)?;
    let result = state
        .executor
        .components()
        .policy
        .enforce(&request.payload, &request.policies)
        .map_err(api_error)?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
struct RedactRequest {
    payload: Value,
}

async fn policy_redact(
    State(state): State<AppState>,
    payload: Result<Json<RedactRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let request = json_body(payload)?;
    let redacted = state.executor.components().policy.redact(&request.payload);
    Ok(Json(json!({ "redacted": redacted })))
}
