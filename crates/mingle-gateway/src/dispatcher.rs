use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use mingle_db::Database;
use mingle_db::models::{ConversationRow, MessageRow, format_ts, parse_ts};
use mingle_db::queries::NewAttachment;
use mingle_types::events::GatewayEvent;
use mingle_types::models::{Attachment, AttachmentKind, Message};

use crate::registry::ConnectionRegistry;
use crate::storage::ObjectStore;

/// Media types accepted for message attachments.
pub const ALLOWED_CONTENT_TYPES: &[&str] =
    &["image/jpeg", "image/png", "image/gif", "audio/mpeg"];

/// A decoded attachment as received from the REST layer.
pub struct AttachmentInput {
    pub name: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("conversation not found")]
    ConversationNotFound,
    #[error("sender is not a participant of the conversation")]
    NotParticipant,
    #[error("attachment type not allowed: {0}")]
    AttachmentType(String),
    #[error("attachment upload failed: {0}")]
    Storage(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Orchestrates a message send: membership validation, attachment upload,
/// persistence, then best-effort fan-out to every other participant's live
/// connections. Persistence is the durability boundary — the returned
/// message reflects what was stored whether or not any socket delivery
/// succeeded.
#[derive(Clone)]
pub struct Dispatcher {
    db: Arc<Database>,
    registry: ConnectionRegistry,
    store: Arc<dyn ObjectStore>,
}

impl Dispatcher {
    pub fn new(db: Arc<Database>, registry: ConnectionRegistry, store: Arc<dyn ObjectStore>) -> Self {
        Self { db, registry, store }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub async fn send_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        body: String,
        attachments: Vec<AttachmentInput>,
    ) -> Result<Message, DispatchError> {
        let conversation = self
            .load_conversation(conversation_id)
            .await?
            .ok_or(DispatchError::ConversationNotFound)?;

        let sender_key = sender_id.to_string();
        if !conversation.participants.contains(&sender_key) {
            return Err(DispatchError::NotParticipant);
        }

        // Validate the whole batch before any upload, so a rejected
        // attachment can never leave earlier siblings orphaned in storage.
        for att in &attachments {
            if !ALLOWED_CONTENT_TYPES.contains(&att.content_type.as_str()) {
                return Err(DispatchError::AttachmentType(att.content_type.clone()));
            }
        }

        let message_id = Uuid::new_v4();
        // Truncate to stored precision up front, so the ack, the push
        // event and the persisted row all carry the identical instant.
        let timestamp = parse_ts(&format_ts(Utc::now()))?;

        let mut stored: Vec<Attachment> = Vec::with_capacity(attachments.len());
        for att in attachments {
            let kind = AttachmentKind::from_content_type(&att.content_type)
                .ok_or_else(|| DispatchError::AttachmentType(att.content_type.clone()))?;
            let object_name = format!("{}_{}", timestamp.format("%Y%m%d%H%M%S"), att.name);
            let path = format!("chat/{}/{}", conversation_id, object_name);
            let url = self
                .store
                .upload(&path, att.data)
                .await
                .map_err(|e| DispatchError::Storage(e.to_string()))?;
            stored.push(Attachment {
                kind,
                name: object_name,
                url,
            });
        }

        let row = MessageRow {
            id: message_id.to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_key.clone(),
            body: body.clone(),
            created_at: format_ts(timestamp),
        };
        let new_attachments: Vec<NewAttachment> = stored
            .iter()
            .map(|a| NewAttachment {
                kind: a.kind.as_str().to_string(),
                name: a.name.clone(),
                url: a.url.clone(),
            })
            .collect();

        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.insert_message(&row, &new_attachments))
            .await
            .map_err(|e| anyhow::anyhow!("spawn_blocking join error: {}", e))??;

        let message = Message {
            id: message_id,
            conversation_id,
            sender_id,
            body,
            timestamp,
            attachments: stored,
        };

        self.fan_out(&conversation, &message).await;

        Ok(message)
    }

    async fn load_conversation(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<ConversationRow>, DispatchError> {
        let db = self.db.clone();
        let id = conversation_id.to_string();
        let row = tokio::task::spawn_blocking(move || db.get_conversation(&id))
            .await
            .map_err(|e| anyhow::anyhow!("spawn_blocking join error: {}", e))??;
        Ok(row)
    }

    /// Push the persisted message to every other participant's live
    /// connections. Delivery failures on one handle never abort the rest
    /// and never surface to the sender — an offline participant catches up
    /// through the fetch endpoints instead.
    async fn fan_out(&self, conversation: &ConversationRow, message: &Message) {
        let event = GatewayEvent::MessageCreate {
            conversation_id: message.conversation_id,
            message_id: message.id,
            sender_id: message.sender_id,
            message: message.body.clone(),
            timestamp: message.timestamp,
            attachments: message.attachments.clone(),
        };

        for participant in &conversation.participants {
            let Ok(user_id) = participant.parse::<Uuid>() else {
                warn!("Corrupt participant id '{}' in conversation {}", participant, conversation.id);
                continue;
            };
            if user_id == message.sender_id {
                continue;
            }

            for tx in self.registry.connections_for(user_id).await {
                if tx.send(event.clone()).is_err() {
                    // The connection closed between snapshot and send.
                    debug!("Dropped delivery to a closed connection of {}", user_id);
                }
            }
        }
    }

    /// Catch-up view of a conversation's messages for the fetch endpoints.
    pub async fn messages_since(
        &self,
        conversation_id: Uuid,
        since: Option<chrono::DateTime<Utc>>,
        exclude_sender: Option<Uuid>,
    ) -> anyhow::Result<Vec<Message>> {
        let db = self.db.clone();
        let id = conversation_id.to_string();
        let since_key = since.map(format_ts);
        let sender_key = exclude_sender.map(|u| u.to_string());

        let (rows, attachment_rows) = tokio::task::spawn_blocking(move || {
            let rows = db.fetch_messages_since(&id, since_key.as_deref(), sender_key.as_deref())?;
            let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
            let attachment_rows = db.get_attachments_for_messages(&ids)?;
            anyhow::Ok((rows, attachment_rows))
        })
        .await
        .map_err(|e| anyhow::anyhow!("spawn_blocking join error: {}", e))??;

        let mut attachments_by_message: std::collections::HashMap<String, Vec<Attachment>> =
            std::collections::HashMap::new();
        for row in attachment_rows {
            let kind = match row.kind.as_str() {
                "image" => AttachmentKind::Image,
                "video" => AttachmentKind::Video,
                _ => AttachmentKind::Audio,
            };
            attachments_by_message
                .entry(row.message_id.clone())
                .or_default()
                .push(Attachment {
                    kind,
                    name: row.name,
                    url: row.url,
                });
        }

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            messages.push(Message {
                id: row.id.parse()?,
                conversation_id: row.conversation_id.parse()?,
                sender_id: row.sender_id.parse()?,
                body: row.body,
                timestamp: parse_ts(&row.created_at)?,
                attachments: attachments_by_message.remove(&row.id).unwrap_or_default(),
            });
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::BoxFuture;
    use std::sync::Mutex;

    /// Records uploads instead of touching disk.
    struct MemStore {
        uploads: Mutex<Vec<(String, usize)>>,
    }

    impl MemStore {
        fn new() -> Self {
            Self {
                uploads: Mutex::new(vec![]),
            }
        }

        fn upload_count(&self) -> usize {
            self.uploads.lock().unwrap().len()
        }
    }

    impl ObjectStore for MemStore {
        fn upload<'a>(&'a self, path: &'a str, bytes: Vec<u8>) -> BoxFuture<'a, anyhow::Result<String>> {
            Box::pin(async move {
                self.uploads.lock().unwrap().push((path.to_string(), bytes.len()));
                Ok(format!("/files/{}", path))
            })
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        store: Arc<MemStore>,
        db: Arc<Database>,
        alice: Uuid,
        bob: Uuid,
        conversation: Uuid,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        db.create_user(&alice.to_string(), "alice", "hash", "Alice", None).unwrap();
        db.create_user(&bob.to_string(), "bob", "hash", "Bob", None).unwrap();

        let conversation = Uuid::new_v4();
        db.insert_conversation(&ConversationRow {
            id: conversation.to_string(),
            kind: "direct".into(),
            created_by: alice.to_string(),
            created_at: format_ts(Utc::now()),
            name: None,
            participants: vec![alice.to_string(), bob.to_string()],
        })
        .unwrap();

        let store = Arc::new(MemStore::new());
        let dispatcher = Dispatcher::new(db.clone(), ConnectionRegistry::new(), store.clone());
        Fixture {
            dispatcher,
            store,
            db,
            alice,
            bob,
            conversation,
        }
    }

    #[tokio::test]
    async fn send_persists_and_pushes_to_recipient() {
        let f = fixture();
        let (_conn, mut bob_rx) = f.dispatcher.registry().register(f.bob).await;
        let (_aconn, mut alice_rx) = f.dispatcher.registry().register(f.alice).await;

        let started = parse_ts(&format_ts(Utc::now())).unwrap();
        let message = f
            .dispatcher
            .send_message(f.conversation, f.alice, "hello".into(), vec![])
            .await
            .unwrap();

        assert_eq!(message.sender_id, f.alice);
        assert_eq!(message.body, "hello");
        assert!(message.timestamp >= started);
        // The ack carries the stored (microsecond) precision, nothing finer.
        assert_eq!(message.timestamp.timestamp_subsec_nanos() % 1_000, 0);

        // Bob's live connection got the push; Alice, the sender, did not.
        match bob_rx.recv().await.unwrap() {
            GatewayEvent::MessageCreate {
                conversation_id,
                sender_id,
                message: body,
                ..
            } => {
                assert_eq!(conversation_id, f.conversation);
                assert_eq!(sender_id, f.alice);
                assert_eq!(body, "hello");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(alice_rx.try_recv().is_err());

        // Exactly one message persisted.
        let stored = f
            .dispatcher
            .messages_since(f.conversation, None, None)
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, message.id);
        // Byte-exact agreement between the ack and the persisted row.
        assert_eq!(stored[0].timestamp, message.timestamp);
    }

    #[tokio::test]
    async fn fan_out_survives_a_closed_connection() {
        let f = fixture();
        let (_c1, mut rx1) = f.dispatcher.registry().register(f.bob).await;
        let (_c2, rx2) = f.dispatcher.registry().register(f.bob).await;
        let (_c3, mut rx3) = f.dispatcher.registry().register(f.bob).await;

        // One of Bob's three connections is already gone at delivery time.
        drop(rx2);

        let result = f
            .dispatcher
            .send_message(f.conversation, f.alice, "still here".into(), vec![])
            .await;
        assert!(result.is_ok());

        assert!(matches!(rx1.recv().await, Some(GatewayEvent::MessageCreate { .. })));
        assert!(matches!(rx3.recv().await, Some(GatewayEvent::MessageCreate { .. })));
    }

    #[tokio::test]
    async fn non_participant_sender_is_rejected_without_persisting() {
        let f = fixture();
        let mallory = Uuid::new_v4();

        let err = f
            .dispatcher
            .send_message(f.conversation, mallory, "let me in".into(), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotParticipant));

        let stored = f.db.fetch_messages_since(&f.conversation.to_string(), None, None).unwrap();
        assert!(stored.is_empty());
    }

    #[tokio::test]
    async fn unknown_conversation_is_not_found() {
        let f = fixture();
        let err = f
            .dispatcher
            .send_message(Uuid::new_v4(), f.alice, "anyone?".into(), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::ConversationNotFound));
    }

    #[tokio::test]
    async fn invalid_attachment_rejects_batch_before_any_upload() {
        let f = fixture();

        let err = f
            .dispatcher
            .send_message(
                f.conversation,
                f.alice,
                "mixed batch".into(),
                vec![
                    AttachmentInput {
                        name: "ok.png".into(),
                        content_type: "image/png".into(),
                        data: vec![1, 2, 3],
                    },
                    AttachmentInput {
                        name: "nope.exe".into(),
                        content_type: "application/octet-stream".into(),
                        data: vec![4],
                    },
                ],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::AttachmentType(_)));
        // All-or-nothing: the valid sibling was never uploaded either.
        assert_eq!(f.store.upload_count(), 0);
        let stored = f.db.fetch_messages_since(&f.conversation.to_string(), None, None).unwrap();
        assert!(stored.is_empty());
    }

    #[tokio::test]
    async fn attachments_upload_in_order_and_echo_in_ack() {
        let f = fixture();

        let message = f
            .dispatcher
            .send_message(
                f.conversation,
                f.alice,
                "pics".into(),
                vec![
                    AttachmentInput {
                        name: "a.jpg".into(),
                        content_type: "image/jpeg".into(),
                        data: vec![0; 10],
                    },
                    AttachmentInput {
                        name: "b.mp3".into(),
                        content_type: "audio/mpeg".into(),
                        data: vec![0; 20],
                    },
                ],
            )
            .await
            .unwrap();

        assert_eq!(f.store.upload_count(), 2);
        assert_eq!(message.attachments.len(), 2);
        assert_eq!(message.attachments[0].kind, AttachmentKind::Image);
        assert_eq!(message.attachments[1].kind, AttachmentKind::Audio);
        assert!(message.attachments[0].url.contains(&f.conversation.to_string()));

        // The persisted record carries the same attachment sequence.
        let stored = f
            .dispatcher
            .messages_since(f.conversation, None, None)
            .await
            .unwrap();
        assert_eq!(stored[0].attachments, message.attachments);
    }
}
