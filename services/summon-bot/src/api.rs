//! Operator HTTP API
//!
//! Endpoints:
//! - GET  /health                   : 200 when chat is up and every configured class holds a token
//! - GET  /metrics                  : Prometheus text exposition
//! - GET  /api/token/status         : per-class credential status
//! - POST /api/token/refresh        : force refresh of every configured class
//! - POST /api/token/refresh/{class}: force refresh of one class
//! - GET  /api/chat/status          : chat connection status
//! - POST /api/chat/reconnect       : manual reconnect, resets the retry budget
//!
//! Never exposes tokens.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chat_supervisor::SupervisorHandle;
use credential_store::CredentialStore;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tracing::{info, warn};
use twitch_auth::CredentialClass;

use crate::metrics::record_api_request;

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<CredentialStore>,
    pub chat: SupervisorHandle,
    pub prometheus: PrometheusHandle,
    pub started_at: Instant,
}

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`.
pub fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/token/status", get(token_status))
        .route("/api/token/refresh", post(refresh_all))
        .route("/api/token/refresh/{class}", post(refresh_one))
        .route("/api/chat/status", get(chat_status))
        .route("/api/chat/reconnect", post(chat_reconnect))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// GET /health: 200 when healthy, 503 when degraded.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.store.status_report().await;
    let chat = state.chat.status();
    let tokens_ok = report.all_configured_valid();
    let healthy = chat.connected && tokens_ok;

    let tokens: BTreeMap<_, _> = report
        .classes
        .iter()
        .filter(|(_, s)| s.configured)
        .map(|(class, s)| (class.label(), s.valid))
        .collect();

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    record_api_request("/health", status.as_u16());
    (
        status,
        Json(json!({
            "status": if healthy { "healthy" } else { "degraded" },
            "chat": {
                "state": chat.state,
                "connected": chat.connected,
                "channel": chat.channel,
            },
            "tokens": tokens,
            "uptime_seconds": state.started_at.elapsed().as_secs(),
        })),
    )
}

/// GET /metrics: Prometheus text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

async fn token_status(State(state): State<AppState>) -> impl IntoResponse {
    record_api_request("/api/token/status", 200);
    Json(state.store.status_report().await)
}

/// POST /api/token/refresh: refresh every configured class in turn.
async fn refresh_all(State(state): State<AppState>) -> impl IntoResponse {
    let mut results = BTreeMap::new();
    for class in CredentialClass::ALL {
        if state.store.is_configured(class) {
            results.insert(class.label(), state.store.force_refresh(class).await);
        }
    }
    let success = results.values().all(|ok| *ok);
    info!(?results, "manual refresh of all classes");

    let status = if success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    record_api_request("/api/token/refresh", status.as_u16());
    let body = if success {
        json!({ "success": true, "message": "all tokens refreshed", "results": results })
    } else {
        json!({ "success": false, "error": "token refresh partially failed", "results": results })
    };
    (status, Json(body))
}

/// POST /api/token/refresh/{class}
async fn refresh_one(
    State(state): State<AppState>,
    Path(class): Path<String>,
) -> impl IntoResponse {
    let class: CredentialClass = match class.parse() {
        Ok(c) => c,
        Err(e) => {
            record_api_request("/api/token/refresh/{class}", 400);
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "success": false, "error": format!("{e}") })),
            );
        }
    };

    let success = state.store.force_refresh(class).await;
    let status = if success {
        StatusCode::OK
    } else {
        warn!(class = %class, "manual refresh failed");
        StatusCode::INTERNAL_SERVER_ERROR
    };
    record_api_request("/api/token/refresh/{class}", status.as_u16());
    (
        status,
        Json(json!({ "success": success, "class": class })),
    )
}

async fn chat_status(State(state): State<AppState>) -> impl IntoResponse {
    record_api_request("/api/chat/status", 200);
    Json(state.chat.status())
}

/// POST /api/chat/reconnect: drop any pending retry and connect now.
async fn chat_reconnect(State(state): State<AppState>) -> impl IntoResponse {
    let success = state.chat.force_reconnect().await;
    let status = if success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    record_api_request("/api/chat/reconnect", status.as_u16());
    (status, Json(json!({ "success": success })))
}
