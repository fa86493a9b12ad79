//! WebSocket push sessions.
//!
//! Each connection registers a session with the gateway and forwards its
//! frames as JSON text. Recipient sessions also accept acknowledgment frames
//! from the client; admin sessions only listen.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use courier_common::types::PushFrame;
use courier_notifier::gateway::SessionHandle;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws/notifications/{recipient_id}", get(recipient_socket))
        .route("/ws/admin/acks", get(admin_socket))
}

/// Acknowledgment sent by a recipient client.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckFrame {
    #[serde(default)]
    pub recipient_id: Option<String>,
    pub message: String,
}

/// GET /ws/notifications/:recipient_id: Live notifications for one recipient.
async fn recipient_socket(
    ws: WebSocketUpgrade,
    Path(recipient_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| recipient_session(socket, state, recipient_id))
}

/// GET /ws/admin/acks: Acknowledgment echo for admins.
async fn admin_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| admin_session(socket, state))
}

async fn recipient_session(socket: WebSocket, state: AppState, recipient_id: String) {
    let SessionHandle { id, receiver } = state.sessions().register_recipient(&recipient_id).await;
    let (sink, mut stream) = socket.split();
    let mut forward = tokio::spawn(forward_frames(sink, receiver));

    loop {
        tokio::select! {
            _ = &mut forward => break,
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    handle_ack(&state, &recipient_id, text.as_str()).await;
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    forward.abort();
    state.sessions().unregister_recipient(&recipient_id, id).await;
}

async fn admin_session(socket: WebSocket, state: AppState) {
    let SessionHandle { id, receiver } = state.sessions().register_admin().await;
    let (sink, stream) = socket.split();
    let mut forward = tokio::spawn(forward_frames(sink, receiver));

    tokio::select! {
        _ = &mut forward => {}
        _ = wait_for_close(stream) => {}
    }

    forward.abort();
    state.sessions().unregister_admin(id).await;
}

async fn forward_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut receiver: mpsc::Receiver<PushFrame>,
) {
    while let Some(frame) = receiver.recv().await {
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode push frame");
                continue;
            }
        };
        if sink.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }
}

async fn wait_for_close(mut stream: SplitStream<WebSocket>) {
    while let Some(incoming) = stream.next().await {
        if matches!(incoming, Ok(Message::Close(_)) | Err(_)) {
            break;
        }
    }
}

async fn handle_ack(state: &AppState, session_recipient: &str, text: &str) {
    let ack: AckFrame = match serde_json::from_str(text) {
        Ok(ack) => ack,
        Err(e) => {
            tracing::debug!(error = %e, "Ignoring unparsable client frame");
            return;
        }
    };
    let recipient_id = ack
        .recipient_id
        .as_deref()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or(session_recipient);

    tracing::info!(recipient_id, "Acknowledgment received");
    if let Err(e) = state.gateway.submit_ack(recipient_id, &ack.message).await {
        tracing::warn!(recipient_id, error = %e, "Failed to publish acknowledgment");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_frame_recipient_is_optional() {
        let ack: AckFrame = serde_json::from_str(r#"{"message":"Got it"}"#).unwrap();
        assert_eq!(ack.recipient_id, None);

        let ack: AckFrame =
            serde_json::from_str(r#"{"recipientId":"stu1","message":"Got it"}"#).unwrap();
        assert_eq!(ack.recipient_id.as_deref(), Some("stu1"));
    }
}
