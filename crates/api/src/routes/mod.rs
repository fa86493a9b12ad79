pub mod health;
pub mod inapp;
pub mod ledger;
pub mod notify;
pub mod ws;

use axum::Router;

use crate::state::AppState;

/// Build the complete API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(notify::router())
        .merge(inapp::router())
        .merge(ledger::router())
        .merge(ws::router())
        .with_state(state)
}
