//! Producers: encode notification requests and publish them keyed by recipient.

use std::sync::Arc;

use courier_common::error::AppError;
use courier_common::types::Topic;

use crate::channel::{MessageChannel, codec::DELIMITER, encode_payload};

#[derive(Clone)]
pub struct NotificationProducer {
    channel: Arc<dyn MessageChannel>,
}

impl NotificationProducer {
    pub fn new(channel: Arc<dyn MessageChannel>) -> Self {
        Self { channel }
    }

    pub async fn send_email(&self, recipient: &str, body: &str) -> Result<(), AppError> {
        self.publish(Topic::EmailNotifications, recipient, body).await
    }

    pub async fn send_in_app(&self, recipient_id: &str, body: &str) -> Result<(), AppError> {
        self.publish(Topic::InAppNotifications, recipient_id, body).await
    }

    pub async fn send_ack(&self, recipient_id: &str, body: &str) -> Result<(), AppError> {
        self.publish(Topic::AckNotifications, recipient_id, body).await
    }

    async fn publish(&self, topic: Topic, recipient: &str, body: &str) -> Result<(), AppError> {
        let recipient = recipient.trim();
        if recipient.is_empty() {
            return Err(AppError::Validation("recipient must not be empty".into()));
        }
        // The delimiter in a recipient would shift the split on decode.
        if recipient.contains(DELIMITER) {
            return Err(AppError::Validation(format!(
                "recipient must not contain '{}'",
                DELIMITER
            )));
        }

        let payload = encode_payload(recipient, body);
        self.channel
            .publish(topic.as_str(), recipient, &payload)
            .await?;

        tracing::info!(topic = %topic, recipient, "Published notification");
        Ok(())
    }
}
