//! Email notification producers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use courier_common::error::AppError;

use crate::recipients::read_recipients;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/notify/email", post(send_email))
        .route("/notify/emails", post(send_bulk_email))
}

#[derive(Debug, Deserialize)]
pub struct EmailRequest {
    pub email: String,
    pub message: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct BulkEmailRequest {
    #[serde(default)]
    pub message: Option<String>,
}

/// POST /notify/email: Queue one email.
async fn send_email(
    State(state): State<AppState>,
    Json(request): Json<EmailRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    state
        .producer
        .send_email(&request.email, &request.message)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "accepted",
            "message": format!("Email notification accepted for {}", request.email.trim())
        })),
    ))
}

/// POST /notify/emails: Queue one email per recipient in the recipients file.
async fn send_bulk_email(
    State(state): State<AppState>,
    Json(request): Json<BulkEmailRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let recipients = read_recipients(&state.config.recipients_file).await?;
    let message = request
        .message
        .unwrap_or_else(|| state.config.bulk_message.clone());

    let mut accepted = 0usize;
    for recipient in &recipients {
        match state.producer.send_email(recipient, &message).await {
            Ok(()) => accepted += 1,
            // Skip unroutable rows; anything else aborts the batch.
            Err(AppError::Validation(reason)) => {
                tracing::warn!(recipient = %recipient, reason = %reason, "Skipping recipient");
            }
            Err(e) => return Err(e),
        }
    }

    tracing::info!(accepted, total = recipients.len(), "Bulk email accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "accepted",
            "count": accepted
        })),
    ))
}
