// HTTP route handlers for the Polyglot API

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use polyglot_common::types::{ExecutionRequest, FailureKind};
use polyglot_engine::ExecuteError;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::client::ClientIdentity;
use crate::{metrics, AppState};

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 100;

/// POST /execute - Run code and return the normalized result
///
/// Failed user programs are still 200; only refused requests and
/// infrastructure faults change the status.
pub async fn execute_code(
    State(state): State<Arc<AppState>>,
    ClientIdentity(client): ClientIdentity,
    payload: Result<Json<ExecutionRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return invalid_body(rejection),
    };
    match state.coordinator.execute(&client, request).await {
        Ok(result) => {
            metrics::observe_execution(result.language, result.failure_kind, result.execution_time_ms);
            let status = if result.failure_kind == Some(FailureKind::Spawn) {
                StatusCode::INTERNAL_SERVER_ERROR
            } else {
                StatusCode::OK
            };
            (status, Json(result)).into_response()
        }
        Err(e) => error_response(e),
    }
}

/// Unreadable request bodies get the same JSON error shape as refusals
fn invalid_body(rejection: JsonRejection) -> Response {
    let message = rejection.body_text();
    warn!(rejected_status = %rejection.status(), error = %message, "Invalid execution request body");
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": message, "code": "invalid_body" })),
    )
        .into_response()
}

/// Map a refused request onto its HTTP status and JSON body
pub fn error_response(err: ExecuteError) -> Response {
    let message = err.to_string();
    match &err {
        ExecuteError::MissingCode => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": message, "code": err.code() })),
        )
            .into_response(),
        ExecuteError::UnsupportedLanguage { supported, .. } => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": message,
                "code": err.code(),
                "supportedLanguages": supported,
            })),
        )
            .into_response(),
        ExecuteError::RateLimited { retry_after } => {
            metrics::RATE_LIMITED_TOTAL.inc();
            let retry_after_secs = retry_after.as_secs_f64().ceil().max(1.0) as u64;
            (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, retry_after_secs.to_string())],
                Json(json!({
                    "error": message,
                    "code": err.code(),
                    "retryAfterSecs": retry_after_secs,
                })),
            )
                .into_response()
        }
        ExecuteError::Internal(detail) => {
            error!(error = %detail, "Execution fault");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": message, "code": err.code() })),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

/// GET /execute/history - Most recent executions, newest first
pub async fn get_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);
    let ledger = state.coordinator.ledger();
    let history = ledger.recent(limit).await;
    let total = ledger.len().await;

    Json(json!({ "history": history, "total": total }))
}

/// DELETE /execute/history - Forget all recorded executions
pub async fn clear_history(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let removed = state.coordinator.ledger().clear().await;
    info!(removed, "Execution history cleared");

    Json(json!({
        "success": true,
        "message": format!("Cleared {} history entries", removed),
    }))
}

/// GET /execute/metrics - Aggregate execution counters
pub async fn get_execution_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.coordinator.ledger().snapshot().await)
}

/// GET /execute/languages - Configured languages and their backends
pub async fn list_languages(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let coordinator = &state.coordinator;
    let languages: Vec<_> = coordinator
        .supported_languages()
        .into_iter()
        .filter_map(|language| {
            coordinator
                .backend_kind(language)
                .map(|backend| json!({ "name": language, "backend": backend }))
        })
        .collect();

    Json(json!({ "languages": languages }))
}

/// GET /status - Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /metrics - Prometheus exposition
pub async fn prometheus_metrics() -> Response {
    match metrics::render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
