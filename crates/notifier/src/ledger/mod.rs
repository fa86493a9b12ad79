//! Failed-message ledger: the authoritative delivery status per
//! `(recipient, body)` pair.
//!
//! Two writers touch the same rows, the delivery worker and the retry
//! reconciler. Neither reads-then-writes: the worker goes through an atomic
//! upsert and the reconciler through a guarded compare-and-swap update, so
//! concurrent attempts converge instead of overwriting each other.
//!
//! Row invariants every implementation upholds:
//! - at most one row per `(recipient, body)`
//! - `created_at` is written once, on first observation of the pair
//! - `retry_count` never decreases and only the reconciler advances it
//! - `sent = true` is terminal: the error is cleared and the row is frozen

mod memory;
mod postgres;

pub use memory::InMemoryLedger;
pub use postgres::PgLedger;

use async_trait::async_trait;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::FailedMessage;

/// Result of one or more transport attempts, as recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptResult {
    Delivered,
    Failed(String),
}

impl AttemptResult {
    pub fn is_delivered(&self) -> bool {
        matches!(self, AttemptResult::Delivered)
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            AttemptResult::Delivered => None,
            AttemptResult::Failed(error) => Some(error),
        }
    }
}

#[async_trait]
pub trait FailedMessageLedger: Send + Sync {
    /// Record a dispatch outcome, creating the row on first sight of the pair.
    ///
    /// Sets `last_tried_at`; leaves `retry_count` untouched; never flips a sent
    /// row back to unsent.
    async fn upsert_by_recipient_and_body(
        &self,
        recipient: &str,
        body: &str,
        result: &AttemptResult,
    ) -> Result<FailedMessage, AppError>;

    /// Insert an unsent row for the pair if none exists. Returns whether a row was created.
    async fn track_unresolved(&self, recipient: &str, body: &str, error: &str)
    -> Result<bool, AppError>;

    async fn find(&self, recipient: &str, body: &str) -> Result<Option<FailedMessage>, AppError>;

    /// Unsent rows the reconciler may still retry, oldest first.
    async fn list_unsent_below_retry_ceiling(
        &self,
        ceiling: u32,
    ) -> Result<Vec<FailedMessage>, AppError>;

    /// Every unsent row, including the permanently failed ones, oldest first.
    async fn list_unsent(&self) -> Result<Vec<FailedMessage>, AppError>;

    /// Apply one reconciler attempt to row `id`.
    ///
    /// Only applies while the row is still unsent and below `ceiling`; returns
    /// `None` when that no longer holds (another writer got there first).
    async fn record_retry(
        &self,
        id: Uuid,
        result: &AttemptResult,
        ceiling: u32,
    ) -> Result<Option<FailedMessage>, AppError>;

    /// Delete every sent row. Returns the number removed.
    async fn purge_all_sent(&self) -> Result<u64, AppError>;
}
