//! In-app notification persistence.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::Mutex;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::NotificationMessage;

#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Persist a notification that is about to be pushed (`sent = true`).
    async fn insert(&self, recipient_id: &str, message: &str)
    -> Result<NotificationMessage, AppError>;

    /// A recipient's notifications, newest first.
    async fn history(&self, recipient_id: &str) -> Result<Vec<NotificationMessage>, AppError>;
}

#[derive(Clone)]
pub struct PgNotificationStore {
    pool: PgPool,
}

impl PgNotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn insert(
        &self,
        recipient_id: &str,
        message: &str,
    ) -> Result<NotificationMessage, AppError> {
        let row: NotificationMessage = sqlx::query_as(
            r#"
            INSERT INTO notification_message (id, recipient_id, message, sent, created_at)
            VALUES ($1, $2, $3, TRUE, $4)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(recipient_id)
        .bind(message)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    async fn history(&self, recipient_id: &str) -> Result<Vec<NotificationMessage>, AppError> {
        let rows: Vec<NotificationMessage> = sqlx::query_as(
            r#"
            SELECT * FROM notification_message
            WHERE recipient_id = $1
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(recipient_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

/// Store kept in process memory, in insertion order.
#[derive(Debug, Default)]
pub struct InMemoryNotificationStore {
    rows: Mutex<Vec<NotificationMessage>>,
}

impl InMemoryNotificationStore {
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

#[async_trait]
impl NotificationStore for InMemoryNotificationStore {
    async fn insert(
        &self,
        recipient_id: &str,
        message: &str,
    ) -> Result<NotificationMessage, AppError> {
        let row = NotificationMessage {
            id: Uuid::new_v4(),
            recipient_id: recipient_id.to_string(),
            message: message.to_string(),
            sent: true,
            created_at: Utc::now(),
        };
        self.rows.lock().await.push(row.clone());
        Ok(row)
    }

    async fn history(&self, recipient_id: &str) -> Result<Vec<NotificationMessage>, AppError> {
        let rows = self.rows.lock().await;
        Ok(rows
            .iter()
            .rev()
            .filter(|row| row.recipient_id == recipient_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_history_is_newest_first_and_scoped() {
        let store = InMemoryNotificationStore::new();
        store.insert("stu1", "first").await.unwrap();
        store.insert("stu2", "other").await.unwrap();
        store.insert("stu1", "second").await.unwrap();

        let history = store.history("stu1").await.unwrap();
        let messages: Vec<_> = history.iter().map(|n| n.message.as_str()).collect();
        assert_eq!(messages, vec!["second", "first"]);
        assert!(history.iter().all(|n| n.sent));
        assert!(store.history("nobody").await.unwrap().is_empty());
    }
}
