//! Courier collaborator API: HTTP entry points for producers, ledger
//! reporting and the WebSocket push sessions.

pub mod recipients;
pub mod routes;
pub mod state;
