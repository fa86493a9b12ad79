//! Push gateway: in-app delivery to live sessions and the acknowledgment loop.
//!
//! In-app payloads are persisted first and then pushed to every session the
//! recipient has open. Acknowledgments from recipients are republished on the
//! ack topic and, once consumed, broadcast to admin sessions. Acks are never
//! persisted; with no admin attached they are simply lost.

pub mod sessions;

pub use sessions::{SessionHandle, SessionRegistry};

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use courier_common::error::AppError;
use courier_common::types::{AckEvent, NotificationMessage, PushFrame, Topic};

use crate::channel::{ConsumerPolicy, MessageChannel, RecordHandler, decode_payload, run_consumer};
use crate::producer::NotificationProducer;
use crate::store::NotificationStore;

#[derive(Clone)]
pub struct PushGateway {
    store: Arc<dyn NotificationStore>,
    sessions: Arc<SessionRegistry>,
    producer: NotificationProducer,
}

impl PushGateway {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        sessions: Arc<SessionRegistry>,
        producer: NotificationProducer,
    ) -> Self {
        Self {
            store,
            sessions,
            producer,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Persist an in-app payload and push it to the recipient's live sessions.
    ///
    /// Returns `None` for a malformed payload. A store failure propagates so
    /// the consumer loop can retry the record.
    pub async fn deliver_in_app(
        &self,
        payload: &str,
    ) -> Result<Option<NotificationMessage>, AppError> {
        let Some(envelope) = decode_payload(payload) else {
            tracing::debug!(payload_len = payload.len(), "Dropping malformed in-app payload");
            return Ok(None);
        };

        let notification = self
            .store
            .insert(&envelope.recipient, &envelope.body)
            .await?;
        let sessions = self
            .sessions
            .push_to_recipient(
                &envelope.recipient,
                PushFrame::Notification(notification.clone()),
            )
            .await;

        tracing::info!(
            recipient_id = %envelope.recipient,
            id = %notification.id,
            sessions,
            "In-app notification delivered"
        );
        Ok(Some(notification))
    }

    /// Accept an acknowledgment from a recipient session.
    pub async fn submit_ack(&self, recipient_id: &str, message: &str) -> Result<(), AppError> {
        self.producer.send_ack(recipient_id, message).await
    }

    /// Broadcast a consumed ack payload to admin sessions. Returns how many
    /// admins received it.
    pub async fn echo_ack(&self, payload: &str) -> usize {
        let Some(envelope) = decode_payload(payload) else {
            tracing::debug!(payload_len = payload.len(), "Dropping malformed ack payload");
            return 0;
        };

        let admins = self
            .sessions
            .broadcast_admin(PushFrame::Ack(AckEvent {
                recipient_id: envelope.recipient.clone(),
                message: envelope.body,
            }))
            .await;

        tracing::info!(recipient_id = %envelope.recipient, admins, "Ack echoed to admins");
        admins
    }

    /// Run the in-app and ack consumers until `shutdown`.
    pub async fn run(
        &self,
        channel: &dyn MessageChannel,
        policy: ConsumerPolicy,
        shutdown: CancellationToken,
    ) -> Result<(), AppError> {
        let inapp = channel
            .subscribe(
                Topic::InAppNotifications.as_str(),
                Topic::InAppNotifications.consumer_group(),
            )
            .await?;
        let acks = channel
            .subscribe(
                Topic::AckNotifications.as_str(),
                Topic::AckNotifications.consumer_group(),
            )
            .await?;

        tokio::try_join!(
            run_consumer(
                inapp,
                policy.clone(),
                Arc::new(InAppHandler(self.clone())),
                shutdown.clone(),
                "inapp-consumer",
            ),
            run_consumer(
                acks,
                policy,
                Arc::new(AckHandler(self.clone())),
                shutdown,
                "ack-consumer",
            ),
        )?;
        Ok(())
    }
}

struct InAppHandler(PushGateway);

#[async_trait]
impl RecordHandler for InAppHandler {
    async fn handle(&self, payload: &str) -> Result<(), AppError> {
        self.0.deliver_in_app(payload).await.map(|_| ())
    }
}

struct AckHandler(PushGateway);

#[async_trait]
impl RecordHandler for AckHandler {
    async fn handle(&self, payload: &str) -> Result<(), AppError> {
        self.0.echo_ack(payload).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelLayout, InMemoryChannel};
    use crate::store::InMemoryNotificationStore;

    fn gateway() -> (InMemoryChannel, Arc<InMemoryNotificationStore>, PushGateway) {
        let channel = InMemoryChannel::new(ChannelLayout::default());
        let store = Arc::new(InMemoryNotificationStore::new());
        let gateway = PushGateway::new(
            store.clone(),
            Arc::new(SessionRegistry::new()),
            NotificationProducer::new(Arc::new(channel.clone())),
        );
        (channel, store, gateway)
    }

    #[tokio::test]
    async fn test_in_app_is_persisted_then_pushed() {
        let (_, store, gateway) = gateway();
        let mut session = gateway.sessions().register_recipient("stu1").await;

        let notification = gateway
            .deliver_in_app("stu1|Welcome")
            .await
            .unwrap()
            .unwrap();

        assert!(notification.sent);
        assert_eq!(store.history("stu1").await.unwrap(), vec![notification.clone()]);
        assert_eq!(
            session.receiver.recv().await,
            Some(PushFrame::Notification(notification))
        );
    }

    #[tokio::test]
    async fn test_in_app_without_sessions_is_still_stored() {
        let (_, store, gateway) = gateway();
        gateway.deliver_in_app("stu1|Welcome").await.unwrap();
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_malformed_in_app_is_dropped() {
        let (_, store, gateway) = gateway();
        assert_eq!(gateway.deliver_in_app("garbage").await.unwrap(), None);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_submit_ack_republishes_keyed_by_recipient() {
        let (channel, _, gateway) = gateway();
        gateway.submit_ack("stu1", "Got it").await.unwrap();
        assert_eq!(channel.published("ack_notifications"), vec!["stu1|Got it"]);
    }

    #[tokio::test]
    async fn test_echo_reaches_admins_only() {
        let (_, store, gateway) = gateway();
        let mut admin = gateway.sessions().register_admin().await;
        let mut recipient = gateway.sessions().register_recipient("stu1").await;

        assert_eq!(gateway.echo_ack("stu1|Got it").await, 1);
        assert_eq!(
            admin.receiver.recv().await,
            Some(PushFrame::Ack(AckEvent {
                recipient_id: "stu1".into(),
                message: "Got it".into(),
            }))
        );
        assert!(admin.receiver.try_recv().is_err());
        assert!(recipient.receiver.try_recv().is_err());
        // Acknowledgments are relayed, never stored.
        assert!(store.is_empty().await);
    }
}
