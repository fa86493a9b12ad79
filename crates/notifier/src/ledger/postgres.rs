use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::FailedMessage;

use super::{AttemptResult, FailedMessageLedger};

/// Ledger backed by the `failed_message` table.
///
/// Convergence of concurrent writers relies on the
/// `UNIQUE (recipient, body_hash)` constraint and single-statement updates.
/// `body_hash` is the SHA-256 of the UTF-8 body, so arbitrarily large bodies
/// stay indexable.
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn body_hash(body: &str) -> Vec<u8> {
    Sha256::digest(body.as_bytes()).to_vec()
}

#[async_trait]
impl FailedMessageLedger for PgLedger {
    async fn upsert_by_recipient_and_body(
        &self,
        recipient: &str,
        body: &str,
        result: &AttemptResult,
    ) -> Result<FailedMessage, AppError> {
        let now = Utc::now();

        let row: FailedMessage = sqlx::query_as(
            r#"
            INSERT INTO failed_message (id, recipient, body, body_hash, error, sent, created_at, last_tried_at, retry_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7, 0)
            ON CONFLICT (recipient, body_hash) DO UPDATE SET
                sent = failed_message.sent OR EXCLUDED.sent,
                error = CASE
                    WHEN failed_message.sent OR EXCLUDED.sent THEN NULL
                    ELSE EXCLUDED.error
                END,
                last_tried_at = CASE
                    WHEN failed_message.sent THEN failed_message.last_tried_at
                    ELSE EXCLUDED.last_tried_at
                END
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(recipient)
        .bind(body)
        .bind(body_hash(body))
        .bind(result.error())
        .bind(result.is_delivered())
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    async fn track_unresolved(
        &self,
        recipient: &str,
        body: &str,
        error: &str,
    ) -> Result<bool, AppError> {
        let now = Utc::now();

        let inserted = sqlx::query(
            r#"
            INSERT INTO failed_message (id, recipient, body, body_hash, error, sent, created_at, last_tried_at, retry_count)
            VALUES ($1, $2, $3, $4, $5, FALSE, $6, $6, 0)
            ON CONFLICT (recipient, body_hash) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(recipient)
        .bind(body)
        .bind(body_hash(body))
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(inserted == 1)
    }

    async fn find(&self, recipient: &str, body: &str) -> Result<Option<FailedMessage>, AppError> {
        let row: Option<FailedMessage> =
            sqlx::query_as("SELECT * FROM failed_message WHERE recipient = $1 AND body_hash = $2")
                .bind(recipient)
                .bind(body_hash(body))
                .fetch_optional(&self.pool)
                .await?;

        Ok(row)
    }

    async fn list_unsent_below_retry_ceiling(
        &self,
        ceiling: u32,
    ) -> Result<Vec<FailedMessage>, AppError> {
        let rows: Vec<FailedMessage> = sqlx::query_as(
            r#"
            SELECT * FROM failed_message
            WHERE sent = FALSE AND retry_count < $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(ceiling as i32)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn list_unsent(&self) -> Result<Vec<FailedMessage>, AppError> {
        let rows: Vec<FailedMessage> = sqlx::query_as(
            "SELECT * FROM failed_message WHERE sent = FALSE ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn record_retry(
        &self,
        id: Uuid,
        result: &AttemptResult,
        ceiling: u32,
    ) -> Result<Option<FailedMessage>, AppError> {
        let increment: i32 = if result.is_delivered() { 0 } else { 1 };

        // The WHERE clause is the compare-and-swap guard: a row that was sent
        // or hit the ceiling in the meantime is left alone.
        let row: Option<FailedMessage> = sqlx::query_as(
            r#"
            UPDATE failed_message SET
                sent = $2,
                error = $3,
                retry_count = retry_count + $4,
                last_tried_at = $5
            WHERE id = $1 AND sent = FALSE AND retry_count < $6
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(result.is_delivered())
        .bind(result.error())
        .bind(increment)
        .bind(Utc::now())
        .bind(ceiling as i32)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn purge_all_sent(&self) -> Result<u64, AppError> {
        let deleted = sqlx::query("DELETE FROM failed_message WHERE sent = TRUE")
            .execute(&self.pool)
            .await?
            .rows_affected();

        tracing::info!(deleted, "Purged sent ledger rows");
        Ok(deleted)
    }
}
