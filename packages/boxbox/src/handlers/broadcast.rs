use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use session_relay::Message;
use tracing::info;

use crate::AppState;
use crate::auth::AuthUser;

/// Relay a server-side event to every connection in a session.
///
/// The body must be a JSON object with a string `type`; the caller is
/// attached as `sender`.
pub async fn broadcast_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    user: AuthUser,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    let body = match body {
        Ok(Json(body)) => body,
        Err(rejection) => return unprocessable(rejection.body_text()),
    };
    let mut message = match Message::from_object(body) {
        Ok(message) => message,
        Err(e) => return unprocessable(e.to_string()),
    };
    message.insert(
        "sender",
        json!({ "id": user.id, "username": user.username }),
    );

    let report = state.relay.broadcast(&message, Some(&session_id)).await;
    state.metrics.rest_broadcast();
    info!(
        session = %session_id,
        user = %user.username,
        kind = message.kind(),
        recipients = report.recipients,
        "REST broadcast"
    );

    Json(json!({
        "status": "Message broadcast initiated",
        "recipients": report.recipients,
    }))
    .into_response()
}

/// Named sessions with their live connection counts.
pub async fn list_sessions_handler(State(state): State<AppState>) -> impl IntoResponse {
    let registry = state.relay.registry();
    Json(json!({
        "sessions": registry.sessions().await,
        "connections": registry.member_count(session_relay::ALL_SESSIONS).await,
    }))
}

fn unprocessable(detail: String) -> Response {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(json!({ "detail": detail })),
    )
        .into_response()
}
