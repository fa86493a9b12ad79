use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Named topics on the message channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// `recipient|body` payloads bound for the mail gateway.
    EmailNotifications,
    /// `recipientId|message` payloads pushed to live sessions.
    InAppNotifications,
    /// `recipientId|message` acknowledgments echoed to admins.
    AckNotifications,
}

impl Topic {
    pub const ALL: [Topic; 3] = [
        Topic::EmailNotifications,
        Topic::InAppNotifications,
        Topic::AckNotifications,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::EmailNotifications => "email_notifications",
            Topic::InAppNotifications => "inapp_notifications",
            Topic::AckNotifications => "ack_notifications",
        }
    }

    /// Consumer group the core subscribes with for this topic.
    pub fn consumer_group(&self) -> &'static str {
        match self {
            Topic::EmailNotifications => "email-group",
            Topic::InAppNotifications => "inapp-group",
            Topic::AckNotifications => "ack-group",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable delivery record for a transport-bound notification.
///
/// One row per `(recipient, body)` pair. `retry_count` counts reconciler
/// attempts and never decreases; once `sent` is true the row is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct FailedMessage {
    pub id: Uuid,
    pub recipient: String,
    pub body: String,
    pub error: Option<String>,
    pub sent: bool,
    pub created_at: DateTime<Utc>,
    pub last_tried_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
}

impl FailedMessage {
    /// True once the reconciler has given up on this row.
    pub fn is_permanently_failed(&self, ceiling: u32) -> bool {
        !self.sent && self.retry_count >= ceiling as i32
    }
}

/// An in-app notification as persisted by the push gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct NotificationMessage {
    pub id: Uuid,
    pub recipient_id: String,
    pub message: String,
    pub sent: bool,
    pub created_at: DateTime<Utc>,
}

/// Acknowledgment flowing from a recipient back to the admin side. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckEvent {
    pub recipient_id: String,
    pub message: String,
}

/// Frame written to a live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PushFrame {
    Notification(NotificationMessage),
    Ack(AckEvent),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names() {
        assert_eq!(Topic::EmailNotifications.as_str(), "email_notifications");
        assert_eq!(Topic::InAppNotifications.to_string(), "inapp_notifications");
        assert_eq!(Topic::AckNotifications.consumer_group(), "ack-group");
    }

    #[test]
    fn test_ack_frame_json_shape() {
        let frame = PushFrame::Ack(AckEvent {
            recipient_id: "stu1".to_string(),
            message: "got it".to_string(),
        });
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "ack");
        assert_eq!(json["recipientId"], "stu1");
        assert_eq!(json["message"], "got it");
    }

    #[test]
    fn test_permanently_failed_requires_unsent_at_ceiling() {
        let mut row = FailedMessage {
            id: Uuid::new_v4(),
            recipient: "alice@example.com".to_string(),
            body: "hi".to_string(),
            error: Some("smtp down".to_string()),
            sent: false,
            created_at: Utc::now(),
            last_tried_at: None,
            retry_count: 3,
        };
        assert!(row.is_permanently_failed(3));
        row.retry_count = 2;
        assert!(!row.is_permanently_failed(3));
        row.retry_count = 3;
        row.sent = true;
        assert!(!row.is_permanently_failed(3));
    }
}
