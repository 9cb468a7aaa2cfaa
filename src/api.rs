// =============================================================================
// Read-Model API — Axum 0.7
// =============================================================================
//
// Read-only JSON surface for the UI layer: workflow sessions, trades, day
// reports, audit trail.  No mutation endpoints; operator actions go through
// the CLI.  CORS is configured permissively for development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::app_state::AppState;
use crate::workflows;

/// Build the read-model router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/session/:workflow/:date", get(session))
        .route("/api/trades/:date", get(trades))
        .route("/api/report/:date", get(day_report))
        .route("/api/audit", get(audit))
        .layer(cors)
        .with_state(state)
}

/// Serve the read-model until the process exits.
pub async fn serve(state: Arc<AppState>) -> anyhow::Result<()> {
    let bind = state.config.api_bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(bind = %bind, "read-model API listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    server_time: i64,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

async fn session(
    State(state): State<Arc<AppState>>,
    Path((workflow, date)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.store.load(&workflow, &date) {
        Ok(Some(session)) => Json(json!(session)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no such session" })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("{e:#}") })),
        )
            .into_response(),
    }
}

async fn trades(
    State(state): State<Arc<AppState>>,
    Path(date): Path<String>,
) -> impl IntoResponse {
    Json(json!(state.ledger.by_date(&date)))
}

async fn day_report(
    State(state): State<Arc<AppState>>,
    Path(date): Path<String>,
) -> impl IntoResponse {
    let report = state
        .store
        .load(workflows::POST_TRADE_ANALYSIS, &date)
        .ok()
        .flatten()
        .and_then(|s| s.session_state.get(workflows::keys::DAY_REPORT).cloned());
    match report {
        Some(artifact) => Json(json!(artifact)).into_response(),
        None => Json(serde_json::Value::Null).into_response(),
    }
}

async fn audit(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!(state.audit.recent()))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use tower::ServiceExt;

    fn app() -> (tempfile::TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RuntimeConfig::default();
        config.paper_trading = true;
        config.sessions_dir = dir.path().join("sessions").display().to_string();
        config.ledger_dir = dir.path().join("ledger").display().to_string();
        config.audit_path = dir.path().join("audit.jsonl").display().to_string();
        let state = AppState::build(config).unwrap();
        (dir, router(state))
    }

    #[tokio::test]
    async fn health_responds_ok() {
        let (_dir, app) = app();
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_session_is_404_and_empty_trades_are_ok() {
        let (_dir, app) = app();

        let response = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/session/intraday_analysis/2026-07-30")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/trades/2026-07-30")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
