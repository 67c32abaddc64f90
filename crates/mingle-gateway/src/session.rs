use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use mingle_types::events::GatewayEvent;

use crate::registry::ConnectionRegistry;

/// Drive one realtime connection from open to close.
///
/// The bearer credential was already resolved at the HTTP upgrade layer, so
/// a socket reaching this function is authenticated; a failed credential
/// never creates a registry entry. Registration and the final deregister
/// bracket everything else: whatever path the session loop exits through —
/// clean close, transport error, serialization failure — the tail
/// deregister always runs.
pub async fn handle_connection(
    socket: WebSocket,
    registry: ConnectionRegistry,
    user_id: Uuid,
    username: String,
) {
    let (conn_id, rx) = registry.register(user_id).await;
    info!("{} ({}) connected to gateway", username, user_id);

    run_session(socket, rx, user_id, &username).await;

    registry.deregister(user_id, conn_id).await;
    info!("{} ({}) disconnected from gateway", username, user_id);
}

async fn run_session(
    socket: WebSocket,
    mut rx: mpsc::UnboundedReceiver<GatewayEvent>,
    user_id: Uuid,
    username: &str,
) {
    let (mut sender, mut receiver) = socket.split();

    let ready = GatewayEvent::Ready {
        user_id,
        username: username.to_string(),
    };
    if sender
        .send(Message::Text(serde_json::to_string(&ready).unwrap().into()))
        .await
        .is_err()
    {
        return;
    }

    // Forward registry pushes -> client
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = serde_json::to_string(&event).unwrap();
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // The inbound side exists only to detect closure: message sends travel
    // over REST, not this channel, so application frames are ignored.
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Close(_) = msg {
                break;
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}
