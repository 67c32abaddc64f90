use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Attachment;

/// Events pushed server-to-client over the WebSocket gateway.
/// No client-to-server application messages exist on this channel; the
/// socket is receive-only from the client's point of view, sends go over
/// REST.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms the connection is authenticated and registered.
    Ready { user_id: Uuid, username: String },

    /// A message was persisted to a conversation this user participates in.
    MessageCreate {
        conversation_id: Uuid,
        message_id: Uuid,
        sender_id: Uuid,
        message: String,
        timestamp: chrono::DateTime<chrono::Utc>,
        attachments: Vec<Attachment>,
    },
}
