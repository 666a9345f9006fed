use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::warn;

use crate::analyze::rules::{Rule, RuleMode};
use crate::engine::{
    parse_cutoff, BatchOutcome, Disposition, DispositionOutcome, Engine, PreviewReport,
    RestoreReport,
};
use crate::error::{EngineError, StoreError};
use crate::model::{LearningRecord, LearningSource, Message, MessageId, NewMessage};

#[derive(Clone)]
pub struct AppState {
    engine: Arc<Engine>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/messages", post(ingest))
        .route("/batch", post(batch))
        .route("/preview", get(preview))
        .route("/restore", post(restore))
        .route("/learn", post(learn))
        .route("/disposition", post(disposition))
        .route("/rules", post(upsert_rule))
        .route("/rules/{id}/enabled", post(set_rule_enabled))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

/// Structured `{ "ok": false, "error": ... }` failure.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Store(StoreError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            EngineError::Store(StoreError::DuplicateFingerprint(_)) => StatusCode::CONFLICT,
            EngineError::Store(StoreError::Backend(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(target: "spam", error = %err, "request failed");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rej: JsonRejection) -> Self {
        ApiError::bad_request(rej.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "ok": false, "error": self.message }))).into_response()
    }
}

/// Success envelope: the payload's fields plus `"ok": true`.
#[derive(Serialize)]
pub struct Envelope<T: Serialize> {
    ok: bool,
    #[serde(flatten)]
    body: T,
}

fn ok<T: Serialize>(body: T) -> Json<Envelope<T>> {
    Json(Envelope { ok: true, body })
}

type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

#[derive(Serialize)]
struct HealthOut {
    circuit_open: bool,
}

async fn health(State(state): State<AppState>) -> Json<Envelope<HealthOut>> {
    let circuit_open = state.engine.guard().breaker().is_open(chrono::Utc::now());
    ok(HealthOut { circuit_open })
}

#[derive(Serialize)]
struct MessageOut {
    message: Message,
}

async fn ingest(
    State(state): State<AppState>,
    payload: Result<Json<NewMessage>, JsonRejection>,
) -> ApiResult<MessageOut> {
    let Json(msg) = payload?;
    let message = state.engine.ingest(msg).await?;
    Ok(ok(MessageOut { message }))
}

#[derive(Deserialize, Default)]
struct BatchReq {
    #[serde(default)]
    skip: usize,
    #[serde(default)]
    take: Option<usize>,
}

async fn batch(
    State(state): State<AppState>,
    payload: Result<Json<BatchReq>, JsonRejection>,
) -> ApiResult<BatchOutcome> {
    let Json(req) = payload?;
    let take = req.take.unwrap_or(state.engine.config().scheduler.take);
    let out = state.engine.process_batch(req.skip, take).await?;
    Ok(ok(out))
}

#[derive(Deserialize)]
struct PreviewQuery {
    limit: Option<usize>,
}

async fn preview(
    State(state): State<AppState>,
    Query(q): Query<PreviewQuery>,
) -> ApiResult<PreviewReport> {
    let limit = q.limit.unwrap_or(state.engine.config().batch.preview_limit);
    Ok(ok(state.engine.preview(limit).await?))
}

#[derive(Deserialize)]
struct RestoreReq {
    cutoff: String,
    #[serde(default = "default_true")]
    dry_run: bool,
}

fn default_true() -> bool {
    true
}

async fn restore(
    State(state): State<AppState>,
    payload: Result<Json<RestoreReq>, JsonRejection>,
) -> ApiResult<RestoreReport> {
    let Json(req) = payload?;
    let cutoff = parse_cutoff(&req.cutoff)?;
    Ok(ok(state.engine.restore(cutoff, req.dry_run).await?))
}

#[derive(Deserialize)]
struct LearnReq {
    text: String,
    is_spam: bool,
    #[serde(default)]
    brand: Option<String>,
    #[serde(default)]
    source: Option<String>,
}

#[derive(Serialize)]
struct LearnOut {
    record: LearningRecord,
}

async fn learn(
    State(state): State<AppState>,
    payload: Result<Json<LearnReq>, JsonRejection>,
) -> ApiResult<LearnOut> {
    let Json(req) = payload?;
    let source = match req.source.as_deref() {
        None => LearningSource::Manual,
        Some(s) => LearningSource::parse(s)
            .ok_or_else(|| ApiError::bad_request(format!("unknown learning source '{s}'")))?,
    };
    let record = state
        .engine
        .learning()
        .learn_from_spam_decision(&req.text, req.is_spam, req.brand.as_deref(), source)
        .await?;
    Ok(ok(LearnOut { record }))
}

#[derive(Deserialize)]
struct DispositionReq {
    message_id: MessageId,
    disposition: Disposition,
}

async fn disposition(
    State(state): State<AppState>,
    payload: Result<Json<DispositionReq>, JsonRejection>,
) -> ApiResult<DispositionOutcome> {
    let Json(req) = payload?;
    Ok(ok(state
        .engine
        .record_disposition(req.message_id, req.disposition)
        .await?))
}

#[derive(Deserialize)]
struct RuleReq {
    #[serde(default)]
    id: i64,
    pattern: String,
    mode: String,
    #[serde(default)]
    brand: Option<String>,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    note: Option<String>,
}

#[derive(Serialize)]
struct RuleOut {
    rule: Rule,
}

async fn upsert_rule(
    State(state): State<AppState>,
    payload: Result<Json<RuleReq>, JsonRejection>,
) -> ApiResult<RuleOut> {
    let Json(req) = payload?;
    let mode = RuleMode::parse(&req.mode)
        .ok_or_else(|| ApiError::bad_request(format!("unknown rule mode '{}'", req.mode)))?;
    let mut rule = Rule::new(req.pattern, mode);
    rule.id = req.id;
    rule.brand = req.brand.filter(|b| !b.trim().is_empty());
    rule.enabled = req.enabled;
    rule.note = req.note;
    let rule = state.engine.upsert_rule(rule).await?;
    Ok(ok(RuleOut { rule }))
}

#[derive(Deserialize)]
struct EnabledReq {
    enabled: bool,
}

#[derive(Serialize)]
struct EnabledOut {
    id: i64,
    enabled: bool,
}

async fn set_rule_enabled(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    payload: Result<Json<EnabledReq>, JsonRejection>,
) -> ApiResult<EnabledOut> {
    let Json(req) = payload?;
    if !state.engine.set_rule_enabled(id, req.enabled).await? {
        return Err(EngineError::Store(StoreError::NotFound(format!("rule {id}"))).into());
    }
    Ok(ok(EnabledOut {
        id,
        enabled: req.enabled,
    }))
}
