//! Failed-message ledger reporting.

use axum::extract::State;
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde_json::json;

use courier_common::error::AppError;
use courier_common::types::FailedMessage;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/ledger/unsent", get(list_unsent))
        .route("/api/ledger/sent", delete(purge_sent))
}

/// GET /api/ledger/unsent: Every unsent row, permanently failed ones included.
async fn list_unsent(State(state): State<AppState>) -> Result<Json<Vec<FailedMessage>>, AppError> {
    let rows = state.ledger.list_unsent().await?;
    Ok(Json(rows))
}

/// DELETE /api/ledger/sent: Purge delivered rows.
async fn purge_sent(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let deleted = state.ledger.purge_all_sent().await?;
    tracing::info!(deleted, "Purged sent ledger rows");
    Ok(Json(json!({ "deleted": deleted })))
}
