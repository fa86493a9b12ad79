//! In-app notification producer and history.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use courier_common::error::AppError;
use courier_common::types::NotificationMessage;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/inapp/send", post(send_in_app))
        .route("/api/inapp/{recipient_id}", get(history))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InAppRequest {
    pub recipient_id: String,
    pub message: String,
}

/// POST /api/inapp/send: Queue an in-app notification.
async fn send_in_app(
    State(state): State<AppState>,
    Json(request): Json<InAppRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    state
        .producer
        .send_in_app(&request.recipient_id, &request.message)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "accepted",
            "message": "Notification accepted"
        })),
    ))
}

/// GET /api/inapp/:recipient_id: Notification history, newest first.
async fn history(
    State(state): State<AppState>,
    Path(recipient_id): Path<String>,
) -> Result<Json<Vec<NotificationMessage>>, AppError> {
    let notifications = state.store.history(&recipient_id).await?;
    Ok(Json(notifications))
}
