use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::FailedMessage;

use super::{AttemptResult, FailedMessageLedger};

/// Ledger kept in process memory, keyed by `(recipient, body)`.
///
/// A single lock serialises writers, which gives the same per-row atomicity
/// the unique constraint gives the PostgreSQL ledger.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    rows: Mutex<HashMap<(String, String), FailedMessage>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }
}

fn oldest_first(mut rows: Vec<FailedMessage>) -> Vec<FailedMessage> {
    rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    rows
}

#[async_trait]
impl FailedMessageLedger for InMemoryLedger {
    async fn upsert_by_recipient_and_body(
        &self,
        recipient: &str,
        body: &str,
        result: &AttemptResult,
    ) -> Result<FailedMessage, AppError> {
        let now = Utc::now();
        let mut rows = self.rows.lock().await;
        let row = rows
            .entry((recipient.to_string(), body.to_string()))
            .or_insert_with(|| FailedMessage {
                id: Uuid::new_v4(),
                recipient: recipient.to_string(),
                body: body.to_string(),
                error: None,
                sent: false,
                created_at: now,
                last_tried_at: None,
                retry_count: 0,
            });

        if !row.sent {
            row.last_tried_at = Some(now);
        }
        row.sent = row.sent || result.is_delivered();
        row.error = if row.sent {
            None
        } else {
            result.error().map(str::to_string)
        };

        Ok(row.clone())
    }

    async fn track_unresolved(
        &self,
        recipient: &str,
        body: &str,
        error: &str,
    ) -> Result<bool, AppError> {
        let now = Utc::now();
        let mut rows = self.rows.lock().await;
        let key = (recipient.to_string(), body.to_string());
        if rows.contains_key(&key) {
            return Ok(false);
        }

        rows.insert(
            key,
            FailedMessage {
                id: Uuid::new_v4(),
                recipient: recipient.to_string(),
                body: body.to_string(),
                error: Some(error.to_string()),
                sent: false,
                created_at: now,
                last_tried_at: Some(now),
                retry_count: 0,
            },
        );
        Ok(true)
    }

    async fn find(&self, recipient: &str, body: &str) -> Result<Option<FailedMessage>, AppError> {
        let rows = self.rows.lock().await;
        Ok(rows
            .get(&(recipient.to_string(), body.to_string()))
            .cloned())
    }

    async fn list_unsent_below_retry_ceiling(
        &self,
        ceiling: u32,
    ) -> Result<Vec<FailedMessage>, AppError> {
        let rows = self.rows.lock().await;
        Ok(oldest_first(
            rows.values()
                .filter(|row| !row.sent && row.retry_count < ceiling as i32)
                .cloned()
                .collect(),
        ))
    }

    async fn list_unsent(&self) -> Result<Vec<FailedMessage>, AppError> {
        let rows = self.rows.lock().await;
        Ok(oldest_first(
            rows.values().filter(|row| !row.sent).cloned().collect(),
        ))
    }

    async fn record_retry(
        &self,
        id: Uuid,
        result: &AttemptResult,
        ceiling: u32,
    ) -> Result<Option<FailedMessage>, AppError> {
        let mut rows = self.rows.lock().await;
        let Some(row) = rows.values_mut().find(|row| row.id == id) else {
            return Ok(None);
        };
        if row.sent || row.retry_count >= ceiling as i32 {
            return Ok(None);
        }

        match result {
            AttemptResult::Delivered => {
                row.sent = true;
                row.error = None;
            }
            AttemptResult::Failed(error) => {
                row.retry_count += 1;
                row.error = Some(error.clone());
            }
        }
        row.last_tried_at = Some(Utc::now());

        Ok(Some(row.clone()))
    }

    async fn purge_all_sent(&self) -> Result<u64, AppError> {
        let mut rows = self.rows.lock().await;
        let before = rows.len();
        rows.retain(|_, row| !row.sent);
        Ok((before - rows.len()) as u64)
    }
}
