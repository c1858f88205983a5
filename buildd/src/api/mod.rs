//! Build API
//!
//! Deploy trigger plus read-only access to the run ledger. History endpoints
//! answer `503` when the engine runs without a ledger.

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use engine::{LedgerError, LedgerReader};
use serde::Deserialize;
use tracing::{error, info};

use crate::AppState;

const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 500;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/api/projects", get(list_projects))
        .route("/api/builds", get(list_builds))
        .route("/api/builds/deploy", post(deploy))
        .route("/api/builds/stats", get(build_stats))
        .route("/api/builds/{id}", get(get_build))
        .route("/api/builds/{id}/log", get(get_build_log))
        .route("/api/builds/projects/{id}/log", get(get_project_log))
}

/// GET /health
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// GET /api/projects: configured projects, publishable or not
async fn list_projects(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.config().projects.clone())
}

/// POST /api/builds/deploy: run the whole workflow and wait for it
async fn deploy(State(state): State<AppState>) -> Response {
    info!("deploy requested");
    match state.engine.try_run_workflow().await {
        Some(result) => Json(result).into_response(),
        None => (StatusCode::CONFLICT, "A build is already in progress").into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

/// GET /api/builds?limit=N
async fn list_builds(State(state): State<AppState>, Query(query): Query<ListQuery>) -> Response {
    let Some(ledger) = ledger(&state) else {
        return ledger_unavailable();
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    match ledger.list_recent(limit).await {
        Ok(runs) => Json(runs).into_response(),
        Err(e) => ledger_error("list builds", e),
    }
}

/// GET /api/builds/stats
async fn build_stats(State(state): State<AppState>) -> Response {
    let Some(ledger) = ledger(&state) else {
        return ledger_unavailable();
    };
    match ledger.statistics().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => ledger_error("build statistics", e),
    }
}

/// GET /api/builds/{id}: run header with its project records
async fn get_build(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    let Some(ledger) = ledger(&state) else {
        return ledger_unavailable();
    };
    match ledger.get_run_detail(id).await {
        Ok(detail) => Json(detail).into_response(),
        Err(e) => ledger_error("get build", e),
    }
}

/// GET /api/builds/{id}/log
async fn get_build_log(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    let Some(ledger) = ledger(&state) else {
        return ledger_unavailable();
    };
    text_log(ledger.get_run_log(id).await, "build log")
}

/// GET /api/builds/projects/{id}/log
async fn get_project_log(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    let Some(ledger) = ledger(&state) else {
        return ledger_unavailable();
    };
    text_log(ledger.get_project_log(id).await, "project log")
}

fn ledger(state: &AppState) -> Option<LedgerReader> {
    state.engine.ledger()
}

fn ledger_unavailable() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "Database not initialized").into_response()
}

/// A row without a stored log answers the same as a missing row.
fn text_log(log: Result<Option<String>, LedgerError>, what: &str) -> Response {
    match log {
        Ok(Some(text)) => (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            text,
        )
            .into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "Log not found").into_response(),
        Err(LedgerError::NotFound(_)) => (StatusCode::NOT_FOUND, "Log not found").into_response(),
        Err(e) => ledger_error(what, e),
    }
}

fn ledger_error(context: &str, e: LedgerError) -> Response {
    match e {
        LedgerError::NotFound(what) => (StatusCode::NOT_FOUND, what).into_response(),
        e => {
            error!("{context}: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
