//! API route definitions.

use std::path::Component;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

use crate::api::state::AppState;
use crate::detect::EventData;
use crate::storage::export::{ExportError, ExportFormat};
use crate::storage::record::{LogInput, LogLevel, LogRecord};
use crate::storage::search::SearchQuery;

const DEFAULT_ALERT_LIMIT: usize = 50;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/logs", post(add_log))
        .route("/logs/search", post(search_logs))
        .route("/logs/{id}", get(get_log))
        .route("/logs/level/{level}", get(logs_by_level))
        .route("/logs/service/{service}", get(logs_by_service))
        .route("/logs/user/{user}", get(logs_by_user))
        .route("/stats", get(stats))
        .route("/analyze/{entity}", post(analyze))
        .route("/alerts", get(alerts))
        .route("/rules", get(rules))
        .route("/export", post(export))
}

// ----- Errors

#[derive(Debug, Error)]
enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) | ApiError::Export(ExportError::UnknownFormat(_)) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Export(_) | ApiError::Join(_) => {
                error!(error = %self, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

fn list(logs: Vec<LogRecord>) -> Json<Value> {
    Json(json!({ "data": logs, "meta": { "total": logs.len() } }))
}

// ----- Handlers

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "logs": state.monitor.store().len()
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

async fn add_log(State(state): State<AppState>, Json(input): Json<LogInput>) -> impl IntoResponse {
    let record = state.monitor.add_log(input);
    (StatusCode::CREATED, Json(json!({ "data": record })))
}

async fn search_logs(State(state): State<AppState>, Json(query): Json<SearchQuery>) -> Json<Value> {
    let result = state.monitor.search(&query);
    Json(json!({
        "data": result.logs,
        "meta": {
            "total": result.total,
            "page": result.page,
            "pageSize": result.page_size,
            "pages": result.pages
        }
    }))
}

async fn get_log(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Value>, ApiError> {
    let record = state
        .monitor
        .get_log(&id)
        .ok_or_else(|| ApiError::NotFound(format!("no log with id {id}")))?;
    Ok(Json(json!({ "data": record })))
}

async fn logs_by_level(
    State(state): State<AppState>,
    Path(level): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let level = level
        .parse::<LogLevel>()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(list(state.monitor.get_by_level(level)))
}

async fn logs_by_service(State(state): State<AppState>, Path(service): Path<String>) -> Json<Value> {
    list(state.monitor.get_by_service(&service))
}

async fn logs_by_user(State(state): State<AppState>, Path(user): Path<String>) -> Json<Value> {
    list(state.monitor.get_by_user(&user))
}

async fn stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "data": state.monitor.stats() }))
}

async fn analyze(
    State(state): State<AppState>,
    Path(entity): Path<String>,
    Json(event): Json<EventData>,
) -> Json<Value> {
    let report = state.monitor.analyze(&entity, &event);
    Json(json!({ "data": report }))
}

#[derive(Debug, Deserialize)]
struct AlertParams {
    limit: Option<usize>,
}

async fn alerts(State(state): State<AppState>, Query(params): Query<AlertParams>) -> Json<Value> {
    let alerts = state
        .monitor
        .recent_alerts(params.limit.unwrap_or(DEFAULT_ALERT_LIMIT));
    Json(json!({
        "data": alerts,
        "meta": { "total": alerts.len(), "raised": state.monitor.detector().total_alerts() }
    }))
}

async fn rules(State(state): State<AppState>) -> Json<Value> {
    let names = state.monitor.rule_names();
    Json(json!({ "data": names, "meta": { "total": names.len() } }))
}

#[derive(Debug, Deserialize)]
struct ExportRequest {
    filename: String,
    format: ExportFormat,
    #[serde(default)]
    filters: SearchQuery,
}

async fn export(
    State(state): State<AppState>,
    Json(req): Json<ExportRequest>,
) -> Result<Json<Value>, ApiError> {
    if req.filename.trim().is_empty() {
        return Err(ApiError::BadRequest("filename must not be empty".to_string()));
    }
    if !stays_in_export_dir(&req.filename) {
        return Err(ApiError::BadRequest(
            "filename must be a relative path inside the export directory".to_string(),
        ));
    }
    let monitor = state.monitor.clone();
    let format = req.format;
    let path = tokio::task::spawn_blocking(move || {
        monitor.export_to_file(&req.filename, format, &req.filters)
    })
    .await??;
    Ok(Json(json!({ "data": { "path": path.display().to_string(), "format": format } })))
}

/// Only plain relative names: no root, drive prefix, `.` or `..` segments.
fn stays_in_export_dir(filename: &str) -> bool {
    let mut components = std::path::Path::new(filename).components().peekable();
    components.peek().is_some() && components.all(|c| matches!(c, Component::Normal(_)))
}
