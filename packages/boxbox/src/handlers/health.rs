use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::AppState;
use crate::auth::AuthUser;
use crate::metrics;

/// API root
pub async fn root_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "message": "Welcome to the BoxBoxBox F1 Platform API",
        "docs": "/api/docs",
    }))
}

/// Health check endpoint - returns server status
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.relay.registry().sessions().await;
    let snapshot = state
        .metrics
        .snapshot(state.relay.stats().snapshot(), sessions);

    let status = if snapshot.errors.websocket == 0 {
        "healthy"
    } else {
        "degraded"
    };

    Json(metrics::HealthStatus {
        status: status.to_string(),
        connections: snapshot.connections.active,
        sessions: snapshot.sessions.len(),
        uptime_secs: snapshot.uptime_secs,
    })
}

/// Metrics endpoint - returns detailed server metrics
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.relay.registry().sessions().await;
    Json(
        state
            .metrics
            .snapshot(state.relay.stats().snapshot(), sessions),
    )
}

/// Liveness probe - returns 200 if the server is running
pub async fn health_live_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive" }))
}

/// Readiness probe - returns 200 if the user directory is reachable
pub async fn health_ready_handler(State(state): State<AppState>) -> Response {
    if state.db.is_reachable().await {
        Json(serde_json::json!({
            "status": "ready",
            "database": "connected"
        }))
        .into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected"
            })),
        )
            .into_response()
    }
}

pub async fn protected_handler(user: AuthUser) -> impl IntoResponse {
    Json(serde_json::json!({
        "message": "This is a protected route",
        "user": user.username,
    }))
}
