//! Courier delivery core.
//!
//! Consumes notification payloads from the message channel and:
//! 1. Delivers email payloads through the mail gateway with bounded, backed-off retry
//! 2. Records every dispatch outcome in the failed-message ledger
//! 3. Periodically re-attempts unsent ledger rows below the retry ceiling
//! 4. Persists in-app notifications and pushes them to live sessions, echoing
//!    recipient acknowledgments back to admin sessions

pub mod backoff;
pub mod channel;
pub mod gateway;
pub mod ledger;
pub mod producer;
pub mod reconciler;
pub mod store;
pub mod testing;
pub mod transport;
pub mod worker;
