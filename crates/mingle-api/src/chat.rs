use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use mingle_db::models::{ConversationRow, format_ts, parse_ts};
use mingle_gateway::dispatcher::AttachmentInput;
use mingle_types::api::{
    ChatDigest, Claims, ConversationInfoResponse, CreateConversationResponse,
    CreateDirectRequest, CreateGroupRequest, EditConversationRequest, FetchResponse,
    MessageView, ParticipantInfo, SendMessageRequest, SendMessageResponse,
};
use mingle_types::models::ConversationKind;

use crate::auth::AppState;
use crate::error::ApiError;

const GROUP_NAME_MIN: usize = 3;
const GROUP_NAME_MAX: usize = 32;

pub async fn create_direct(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateDirectRequest>,
) -> Result<Json<CreateConversationResponse>, ApiError> {
    let me = claims.sub;
    if req.target_user_id == me {
        return Err(ApiError::InvalidInput(
            "cannot open a direct conversation with yourself".into(),
        ));
    }

    let conversation_id = Uuid::new_v4();
    let row = ConversationRow {
        id: conversation_id.to_string(),
        kind: ConversationKind::Direct.as_str().into(),
        created_by: me.to_string(),
        created_at: format_ts(Utc::now()),
        name: None,
        participants: vec![me.to_string(), req.target_user_id.to_string()],
    };

    // The duplicate check and the insert are one atomic operation in the
    // store, so two racing requests for the same pair cannot both create.
    let db = state.db.clone();
    let me_key = me.to_string();
    let target_key = req.target_user_id.to_string();
    let (target_exists, existing) = tokio::task::spawn_blocking(move || {
        if db.get_user_by_id(&target_key)?.is_none() {
            return anyhow::Ok((false, None));
        }
        let existing = db.insert_direct_conversation(&row, &me_key, &target_key)?;
        anyhow::Ok((true, existing))
    })
    .await
    .map_err(|e| anyhow::anyhow!("spawn_blocking join error: {}", e))??;

    if !target_exists {
        return Err(ApiError::NotFound("target user not found".into()));
    }
    if let Some(id) = existing {
        // 409 carries the existing id so the client can redirect into it.
        let conversation_id = id
            .parse()
            .map_err(|e| anyhow::anyhow!("corrupt conversation id '{}': {}", id, e))?;
        return Err(ApiError::DuplicateDirect { conversation_id });
    }

    Ok(Json(CreateConversationResponse { conversation_id }))
}

pub async fn create_group(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateGroupRequest>,
) -> Result<Json<CreateConversationResponse>, ApiError> {
    if req.participants.len() < 2 {
        return Err(ApiError::InvalidInput("at least 2 participants required".into()));
    }
    if let Some(name) = &req.name {
        validate_group_name(name)?;
    }

    // Creator is always part of the group, whether or not the client
    // listed them.
    let mut participants: Vec<String> = req.participants.iter().map(|p| p.to_string()).collect();
    participants.push(claims.sub.to_string());
    participants.sort();
    participants.dedup();

    let conversation_id = Uuid::new_v4();
    let row = ConversationRow {
        id: conversation_id.to_string(),
        kind: ConversationKind::Group.as_str().into(),
        created_by: claims.sub.to_string(),
        created_at: format_ts(Utc::now()),
        name: req.name,
        participants,
    };
    let db = state.db.clone();
    tokio::task::spawn_blocking(move || db.insert_conversation(&row))
        .await
        .map_err(|e| anyhow::anyhow!("spawn_blocking join error: {}", e))??;

    Ok(Json(CreateConversationResponse { conversation_id }))
}

pub async fn edit_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<EditConversationRequest>,
) -> Result<StatusCode, ApiError> {
    let conversation = load_conversation(&state, conversation_id).await?;

    if conversation.kind != ConversationKind::Group.as_str() {
        return Err(ApiError::InvalidInput("only group conversations can be edited".into()));
    }
    if conversation.created_by != claims.sub.to_string() {
        return Err(ApiError::Forbidden("only the creator can edit the conversation".into()));
    }
    if let Some(name) = &req.name {
        validate_group_name(name)?;
    }

    let participants = match req.participants {
        Some(ids) => {
            let mut keys: Vec<String> = ids.iter().map(|p| p.to_string()).collect();
            keys.sort();
            keys.dedup();
            if !keys.contains(&conversation.created_by) {
                return Err(ApiError::InvalidInput("participants must include the creator".into()));
            }
            if keys.len() < 3 {
                return Err(ApiError::InvalidInput("a group needs at least 3 participants".into()));
            }
            Some(keys)
        }
        None => None,
    };

    let db = state.db.clone();
    let id = conversation_id.to_string();
    let name = req.name;
    tokio::task::spawn_blocking(move || {
        db.update_conversation(&id, name.as_deref(), participants.as_deref())
    })
    .await
    .map_err(|e| anyhow::anyhow!("spawn_blocking join error: {}", e))??;

    Ok(StatusCode::OK)
}

pub async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<SendMessageResponse>, ApiError> {
    let mut attachments = Vec::with_capacity(req.attachments.len());
    for upload in req.attachments {
        let data = B64.decode(&upload.data).map_err(|_| {
            ApiError::InvalidInput(format!("attachment '{}' is not valid base64", upload.name))
        })?;
        attachments.push(AttachmentInput {
            name: upload.name,
            content_type: upload.content_type,
            data,
        });
    }

    let message = state
        .dispatcher
        .send_message(conversation_id, claims.sub, req.message, attachments)
        .await?;

    Ok(Json(SendMessageResponse {
        message_id: message.id,
        sender_id: message.sender_id,
        message: message.body,
        timestamp: message.timestamp,
        attachments: message.attachments,
    }))
}

pub async fn conversation_info(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<ConversationInfoResponse>, ApiError> {
    let conversation = load_conversation(&state, conversation_id).await?;
    if !conversation.participants.contains(&claims.sub.to_string()) {
        return Err(ApiError::Forbidden("not a participant of this conversation".into()));
    }

    let db = state.db.clone();
    let ids = conversation.participants.clone();
    let users = tokio::task::spawn_blocking(move || db.get_users_by_ids(&ids))
        .await
        .map_err(|e| anyhow::anyhow!("spawn_blocking join error: {}", e))??;

    let participants = conversation
        .participants
        .iter()
        .filter_map(|id| {
            let user_id = match id.parse::<Uuid>() {
                Ok(uid) => uid,
                Err(e) => {
                    warn!("Corrupt participant id '{}' in conversation {}: {}", id, conversation.id, e);
                    return None;
                }
            };
            let user = users.iter().find(|u| &u.id == id);
            Some(ParticipantInfo {
                user_id,
                username: user.map(|u| u.username.clone()).unwrap_or_else(|| "unknown".into()),
                name: user.map(|u| u.name.clone()).unwrap_or_else(|| "unknown".into()),
                icon_url: user.and_then(|u| u.icon_url.clone()),
            })
        })
        .collect();

    Ok(Json(ConversationInfoResponse {
        conversation_id,
        conversation_type: kind_from_str(&conversation.kind),
        name: conversation.name,
        participants,
        initial_date: parse_ts(&conversation.created_at)?,
    }))
}

#[derive(Debug, Deserialize)]
pub struct FetchQuery {
    pub since: Option<DateTime<Utc>>,
}

/// Catch-up fetch: everything new since the client's last sync. The
/// caller's own messages are excluded — the client already has what it
/// sent — and conversations with nothing new are omitted when a cutoff is
/// given.
pub async fn fetch(
    State(state): State<AppState>,
    Query(query): Query<FetchQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<FetchResponse>, ApiError> {
    build_digest(&state, claims.sub, query.since, Some(claims.sub)).await
}

/// Full history: every conversation the user participates in, all
/// messages ascending, own messages included.
pub async fn fetch_history(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<FetchResponse>, ApiError> {
    build_digest(&state, claims.sub, None, None).await
}

async fn build_digest(
    state: &AppState,
    user_id: Uuid,
    since: Option<DateTime<Utc>>,
    exclude_sender: Option<Uuid>,
) -> Result<Json<FetchResponse>, ApiError> {
    let db = state.db.clone();
    let me = user_id.to_string();
    let conversations = tokio::task::spawn_blocking(move || {
        let ids = db.list_conversation_ids(&me)?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(row) = db.get_conversation(&id)? else {
                continue;
            };
            let Some(last) = db.last_message_time(&id)? else {
                continue;
            };
            out.push((row, last));
        }
        anyhow::Ok(out)
    })
    .await
    .map_err(|e| anyhow::anyhow!("spawn_blocking join error: {}", e))??;

    let mut chats = Vec::with_capacity(conversations.len());
    for (row, last) in conversations {
        let conversation_id: Uuid = row
            .id
            .parse()
            .map_err(|e| anyhow::anyhow!("corrupt conversation id '{}': {}", row.id, e))?;

        let messages = state
            .dispatcher
            .messages_since(conversation_id, since, exclude_sender)
            .await?;
        if since.is_some() && messages.is_empty() {
            continue;
        }

        chats.push(ChatDigest {
            conversation_id,
            conversation_type: kind_from_str(&row.kind),
            last_message_time: parse_ts(&last)?,
            messages: messages
                .into_iter()
                .map(|m| MessageView {
                    message_id: m.id,
                    sender_id: m.sender_id,
                    message: m.body,
                    timestamp: m.timestamp,
                    attachments: m.attachments,
                })
                .collect(),
        });
    }

    Ok(Json(FetchResponse { chats }))
}

async fn load_conversation(state: &AppState, id: Uuid) -> Result<ConversationRow, ApiError> {
    let db = state.db.clone();
    let key = id.to_string();
    tokio::task::spawn_blocking(move || db.get_conversation(&key))
        .await
        .map_err(|e| anyhow::anyhow!("spawn_blocking join error: {}", e))??
        .ok_or_else(|| ApiError::NotFound("conversation not found".into()))
}

fn validate_group_name(name: &str) -> Result<(), ApiError> {
    let len = name.chars().count();
    if !(GROUP_NAME_MIN..=GROUP_NAME_MAX).contains(&len) {
        return Err(ApiError::InvalidInput(format!(
            "group name must be {}-{} characters",
            GROUP_NAME_MIN, GROUP_NAME_MAX
        )));
    }
    Ok(())
}

fn kind_from_str(kind: &str) -> ConversationKind {
    match kind {
        "group" => ConversationKind::Group,
        _ => ConversationKind::Direct,
    }
}
