//! Registry of live push sessions.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use courier_common::types::PushFrame;

/// Frames buffered per session before new ones are dropped.
pub const SESSION_BUFFER: usize = 64;

/// Receiving end of a registered session. The connection task forwards
/// frames from `receiver` to the socket and unregisters `id` on disconnect.
#[derive(Debug)]
pub struct SessionHandle {
    pub id: Uuid,
    pub receiver: mpsc::Receiver<PushFrame>,
}

type Sessions = HashMap<Uuid, mpsc::Sender<PushFrame>>;

#[derive(Debug, Default)]
pub struct SessionRegistry {
    recipients: RwLock<HashMap<String, Sessions>>,
    admins: RwLock<Sessions>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_recipient(&self, recipient_id: &str) -> SessionHandle {
        let (id, sender, handle) = open_session();
        self.recipients
            .write()
            .await
            .entry(recipient_id.to_string())
            .or_default()
            .insert(id, sender);
        tracing::debug!(recipient_id, session = %id, "Recipient session registered");
        handle
    }

    pub async fn unregister_recipient(&self, recipient_id: &str, id: Uuid) {
        let mut recipients = self.recipients.write().await;
        if let Some(sessions) = recipients.get_mut(recipient_id) {
            sessions.remove(&id);
            if sessions.is_empty() {
                recipients.remove(recipient_id);
            }
        }
        tracing::debug!(recipient_id, session = %id, "Recipient session unregistered");
    }

    pub async fn register_admin(&self) -> SessionHandle {
        let (id, sender, handle) = open_session();
        self.admins.write().await.insert(id, sender);
        tracing::debug!(session = %id, "Admin session registered");
        handle
    }

    pub async fn unregister_admin(&self, id: Uuid) {
        self.admins.write().await.remove(&id);
        tracing::debug!(session = %id, "Admin session unregistered");
    }

    /// Push to every live session of `recipient_id`. Returns how many took the frame.
    pub async fn push_to_recipient(&self, recipient_id: &str, frame: PushFrame) -> usize {
        let mut recipients = self.recipients.write().await;
        let Some(sessions) = recipients.get_mut(recipient_id) else {
            return 0;
        };
        let delivered = fan_out(sessions, &frame);
        if sessions.is_empty() {
            recipients.remove(recipient_id);
        }
        delivered
    }

    /// Push to every admin session. Returns how many took the frame.
    pub async fn broadcast_admin(&self, frame: PushFrame) -> usize {
        let mut admins = self.admins.write().await;
        fan_out(&mut admins, &frame)
    }

    pub async fn recipient_session_count(&self, recipient_id: &str) -> usize {
        self.recipients
            .read()
            .await
            .get(recipient_id)
            .map_or(0, HashMap::len)
    }

    pub async fn admin_session_count(&self) -> usize {
        self.admins.read().await.len()
    }
}

fn open_session() -> (Uuid, mpsc::Sender<PushFrame>, SessionHandle) {
    let id = Uuid::new_v4();
    let (sender, receiver) = mpsc::channel(SESSION_BUFFER);
    (id, sender, SessionHandle { id, receiver })
}

/// Best-effort send to each session; closed sessions are pruned.
fn fan_out(sessions: &mut Sessions, frame: &PushFrame) -> usize {
    let mut delivered = 0;
    sessions.retain(|id, sender| match sender.try_send(frame.clone()) {
        Ok(()) => {
            delivered += 1;
            true
        }
        Err(TrySendError::Full(_)) => {
            tracing::warn!(session = %id, "Session buffer full, dropping frame");
            true
        }
        Err(TrySendError::Closed(_)) => false,
    });
    delivered
}

#[cfg(test)]
mod tests {
    use courier_common::types::AckEvent;

    use super::*;

    fn ack(message: &str) -> PushFrame {
        PushFrame::Ack(AckEvent {
            recipient_id: "stu1".to_string(),
            message: message.to_string(),
        })
    }

    #[tokio::test]
    async fn test_push_reaches_every_session_of_recipient() {
        let registry = SessionRegistry::new();
        let mut first = registry.register_recipient("stu1").await;
        let mut second = registry.register_recipient("stu1").await;
        let mut other = registry.register_recipient("stu2").await;

        assert_eq!(registry.push_to_recipient("stu1", ack("hello")).await, 2);
        assert_eq!(first.receiver.recv().await, Some(ack("hello")));
        assert_eq!(second.receiver.recv().await, Some(ack("hello")));
        assert!(other.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_no_sessions_is_fine() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.push_to_recipient("nobody", ack("x")).await, 0);
        assert_eq!(registry.broadcast_admin(ack("x")).await, 0);
    }

    #[tokio::test]
    async fn test_closed_sessions_are_pruned() {
        let registry = SessionRegistry::new();
        let dropped = registry.register_recipient("stu1").await;
        let mut live = registry.register_recipient("stu1").await;
        drop(dropped);

        assert_eq!(registry.push_to_recipient("stu1", ack("x")).await, 1);
        assert_eq!(registry.recipient_session_count("stu1").await, 1);
        assert!(live.receiver.recv().await.is_some());

        drop(live);
        assert_eq!(registry.push_to_recipient("stu1", ack("y")).await, 0);
        assert_eq!(registry.recipient_session_count("stu1").await, 0);
    }

    #[tokio::test]
    async fn test_unregister_removes_session() {
        let registry = SessionRegistry::new();
        let admin = registry.register_admin().await;
        assert_eq!(registry.admin_session_count().await, 1);
        registry.unregister_admin(admin.id).await;
        assert_eq!(registry.admin_session_count().await, 0);

        let session = registry.register_recipient("stu1").await;
        registry.unregister_recipient("stu1", session.id).await;
        assert_eq!(registry.recipient_session_count("stu1").await, 0);
    }

    #[tokio::test]
    async fn test_full_buffer_drops_frame_but_keeps_session() {
        let registry = SessionRegistry::new();
        let _admin = registry.register_admin().await;
        for _ in 0..SESSION_BUFFER {
            assert_eq!(registry.broadcast_admin(ack("x")).await, 1);
        }
        assert_eq!(registry.broadcast_admin(ack("overflow")).await, 0);
        assert_eq!(registry.admin_session_count().await, 1);
    }
}
