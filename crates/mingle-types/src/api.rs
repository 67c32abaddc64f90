use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Attachment, ConversationKind};

// -- JWT Claims --

/// JWT claims shared between the REST middleware and the WebSocket
/// handshake. Canonical definition lives here to avoid drift between the
/// two auth paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    pub name: String,
    pub email: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub user_id: Uuid,
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub user_id: Uuid,
    pub username: String,
    pub token: String,
}

// -- Conversations --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateDirectRequest {
    pub target_user_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateConversationResponse {
    pub conversation_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateGroupRequest {
    pub name: Option<String>,
    pub participants: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EditConversationRequest {
    pub name: Option<String>,
    pub participants: Option<Vec<Uuid>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub user_id: Uuid,
    pub username: String,
    pub name: String,
    pub icon_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationInfoResponse {
    pub conversation_id: Uuid,
    pub conversation_type: ConversationKind,
    pub name: Option<String>,
    pub participants: Vec<ParticipantInfo>,
    pub initial_date: DateTime<Utc>,
}

// -- Messages --

/// Attachment bytes travel inside the JSON body as base64, alongside the
/// declared media type the server validates against its allow-list.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttachmentUpload {
    pub name: String,
    pub content_type: String,
    /// base64-encoded file content
    pub data: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub message: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentUpload>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub message_id: Uuid,
    pub sender_id: Uuid,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub attachments: Vec<Attachment>,
}

// -- Catch-up sync --

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageView {
    pub message_id: Uuid,
    pub sender_id: Uuid,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatDigest {
    pub conversation_id: Uuid,
    pub conversation_type: ConversationKind,
    pub last_message_time: DateTime<Utc>,
    pub messages: Vec<MessageView>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FetchResponse {
    pub chats: Vec<ChatDigest>,
}
