//! Browser-facing read proxy over the trace store, plus the administrative
//! statistics surface. Every handler is an accessor around one store
//! operation, run on the blocking pool so queries never stall the runtime.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use rust_embed::Embed;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use spanvault_store::{ServiceSummary, SpanRecord, StoreError, TraceDb};

#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<TraceDb>,
    pub started: Instant,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/services", get(list_services))
        .route("/api/services/:service", delete(purge_service))
        .route("/api/services/:service/spans", get(service_spans))
        .route("/api/services/:service/traces", get(service_trace_ids))
        .route("/api/traces/:trace_id", get(trace_by_id))
        .route("/api/spans/:span_id/tree", get(span_tree))
        .route("/api/stats", get(stats))
        .route("/healthz", get(healthz))
        .route("/", get(index))
        .fallback(get(static_asset))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

// --- Errors ---

enum ApiError {
    NotFound(&'static str),
    Store(StoreError),
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Store(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(what) => (StatusCode::NOT_FOUND, what.to_string()),
            ApiError::Store(StoreError::InvalidId(m)) => (StatusCode::BAD_REQUEST, m),
            ApiError::Store(StoreError::Closed) => {
                (StatusCode::SERVICE_UNAVAILABLE, "store is closed".to_string())
            }
            ApiError::Store(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Run one store operation on the blocking pool.
async fn on_store<T: Send + 'static>(
    db: &Arc<TraceDb>,
    op: impl FnOnce(&TraceDb) -> Result<T, StoreError> + Send + 'static,
) -> Result<T, ApiError> {
    let db = db.clone();
    tokio::task::spawn_blocking(move || op(&db))
        .await
        .map_err(|e| ApiError::Internal(format!("storage task failed: {}", e)))?
        .map_err(ApiError::Store)
}

// --- Wire types ---

#[derive(Debug, Serialize)]
pub struct SpanJson {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: String,
    pub name: String,
    pub month: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub status: i32,
    /// Original protobuf encoding of the span, as lowercase hex.
    pub raw: String,
}

impl From<SpanRecord> for SpanJson {
    fn from(rec: SpanRecord) -> Self {
        Self {
            trace_id: rec.trace_id,
            span_id: rec.span_id,
            parent_span_id: rec.parent_span_id,
            name: rec.name,
            month: rec.month,
            start: rec.start,
            end: rec.end,
            status: rec.status.as_i32(),
            raw: hex::encode(rec.raw),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ServiceJson {
    pub name: String,
    pub span_count: u64,
    pub trace_count: u64,
    pub last_updated: DateTime<Utc>,
}

impl From<ServiceSummary> for ServiceJson {
    fn from(s: ServiceSummary) -> Self {
        Self {
            name: s.name,
            span_count: s.span_count,
            trace_count: s.trace_count,
            last_updated: s.last_updated,
        }
    }
}

#[derive(Debug, Serialize)]
struct ServiceList {
    services: Vec<ServiceJson>,
}

#[derive(Debug, Serialize)]
struct SpanList {
    spans: Vec<SpanJson>,
}

#[derive(Debug, Serialize)]
struct TraceIdList {
    trace_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct LimitParams {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct Stats {
    uptime_seconds: u64,
    db_path: String,
    retention_days: i64,
    service_count: usize,
    span_count: u64,
    trace_count: u64,
}

// --- Handlers ---

async fn list_services(State(state): State<ApiState>) -> Result<Json<ServiceList>, ApiError> {
    let services = on_store(&state.db, |db| db.list_services()).await?;
    Ok(Json(ServiceList {
        services: services.into_iter().map(Into::into).collect(),
    }))
}

async fn service_spans(
    State(state): State<ApiState>,
    Path(service): Path<String>,
    Query(params): Query<LimitParams>,
) -> Result<Json<SpanList>, ApiError> {
    let limit = params.limit.unwrap_or(0);
    let spans = on_store(&state.db, move |db| db.get_spans(&service, limit)).await?;
    Ok(Json(SpanList {
        spans: spans.into_iter().map(Into::into).collect(),
    }))
}

async fn service_trace_ids(
    State(state): State<ApiState>,
    Path(service): Path<String>,
    Query(params): Query<LimitParams>,
) -> Result<Json<TraceIdList>, ApiError> {
    let limit = params.limit.unwrap_or(0);
    let trace_ids = on_store(&state.db, move |db| db.get_trace_ids(&service, limit)).await?;
    Ok(Json(TraceIdList { trace_ids }))
}

async fn trace_by_id(
    State(state): State<ApiState>,
    Path(trace_id): Path<String>,
) -> Result<Json<SpanList>, ApiError> {
    let spans = on_store(&state.db, move |db| db.get_trace_by_id(&trace_id)).await?;
    if spans.is_empty() {
        return Err(ApiError::NotFound("trace not found"));
    }
    Ok(Json(SpanList {
        spans: spans.into_iter().map(Into::into).collect(),
    }))
}

async fn span_tree(
    State(state): State<ApiState>,
    Path(span_id): Path<String>,
) -> Result<Json<SpanList>, ApiError> {
    let spans = on_store(&state.db, move |db| db.get_span_tree(&span_id)).await?;
    if spans.is_empty() {
        return Err(ApiError::NotFound("span not found"));
    }
    Ok(Json(SpanList {
        spans: spans.into_iter().map(Into::into).collect(),
    }))
}

async fn purge_service(
    State(state): State<ApiState>,
    Path(service): Path<String>,
) -> Result<StatusCode, ApiError> {
    let name = service.clone();
    on_store(&state.db, move |db| db.delete_service(&service)).await?;
    tracing::info!(service = %name, "service partition purged");
    Ok(StatusCode::NO_CONTENT)
}

async fn stats(State(state): State<ApiState>) -> Result<Json<Stats>, ApiError> {
    let services = on_store(&state.db, |db| db.list_services()).await?;
    Ok(Json(Stats {
        uptime_seconds: state.started.elapsed().as_secs(),
        db_path: state.db.path().display().to_string(),
        retention_days: state.db.retention_days(),
        service_count: services.len(),
        span_count: services.iter().map(|s| s.span_count).sum(),
        trace_count: services.iter().map(|s| s.trace_count).sum(),
    }))
}

async fn healthz() -> &'static str {
    "ok"
}

// --- Embedded UI ---

#[derive(Embed)]
#[folder = "static/"]
struct Assets;

async fn index() -> Response {
    serve_asset("index.html")
}

async fn static_asset(uri: Uri) -> Response {
    serve_asset(uri.path().trim_start_matches('/'))
}

fn serve_asset(path: &str) -> Response {
    match Assets::get(path) {
        Some(file) => {
            let mime = mime_guess::from_path(path).first_or_octet_stream();
            ([(header::CONTENT_TYPE, mime.as_ref().to_string())], file.data.into_owned())
                .into_response()
        }
        None => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}
