use crate::Database;
use crate::models::{AttachmentRow, ConversationRow, MessageRow, UserRow};
use anyhow::Result;
use rusqlite::Connection;

/// Attachment payload for insertion; message id and position are assigned
/// by the insert itself.
pub struct NewAttachment {
    pub kind: String,
    pub name: String,
    pub url: String,
}

impl Database {
    // -- Users --

    pub fn create_user(
        &self,
        id: &str,
        username: &str,
        password_hash: &str,
        name: &str,
        email: Option<&str>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password, name, email) VALUES (?1, ?2, ?3, ?4, ?5)",
                (id, username, password_hash, name, email),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            query_user(conn, "SELECT id, username, password, name, email, icon_url, created_at FROM users WHERE username = ?1", username)
        })
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            query_user(conn, "SELECT id, username, password, name, email, icon_url, created_at FROM users WHERE id = ?1", id)
        })
    }

    /// Batch-fetch users for a participant list.
    pub fn get_users_by_ids(&self, ids: &[String]) -> Result<Vec<UserRow>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT id, username, password, name, email, icon_url, created_at FROM users WHERE id IN ({})",
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<&dyn rusqlite::types::ToSql> =
                ids.iter().map(|id| id as &dyn rusqlite::types::ToSql).collect();

            let rows = stmt
                .query_map(params.as_slice(), map_user_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    // -- Conversations --

    /// Insert a conversation together with its participant set, atomically.
    pub fn insert_conversation(&self, row: &ConversationRow) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            insert_conversation_rows(&tx, row)?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Create a DIRECT conversation for the pair unless one already exists.
    /// The existence check and the insert share one transaction under the
    /// connection mutex, so two racing create requests serialize here; the
    /// loser observes the winner's row and gets its id back instead of
    /// inserting a second one.
    pub fn insert_direct_conversation(
        &self,
        row: &ConversationRow,
        a: &str,
        b: &str,
    ) -> Result<Option<String>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            if let Some(existing) = find_direct(&tx, a, b)? {
                return Ok(Some(existing));
            }
            insert_conversation_rows(&tx, row)?;
            tx.commit()?;
            Ok(None)
        })
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, kind, created_by, created_at, name FROM conversations WHERE id = ?1",
                    [id],
                    |row| {
                        Ok(ConversationRow {
                            id: row.get(0)?,
                            kind: row.get(1)?,
                            created_by: row.get(2)?,
                            created_at: row.get(3)?,
                            name: row.get(4)?,
                            participants: vec![],
                        })
                    },
                )
                .optional()?;

            let Some(mut row) = row else {
                return Ok(None);
            };

            let mut stmt = conn.prepare(
                "SELECT user_id FROM conversation_participants WHERE conversation_id = ?1",
            )?;
            row.participants = stmt
                .query_map([id], |r| r.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;

            Ok(Some(row))
        })
    }

    /// The DIRECT conversation whose participant set is exactly {a, b},
    /// if one exists. The participant-count predicate makes this an
    /// exact-set match, which is what keeps the one-direct-conversation-
    /// per-pair invariant sound.
    pub fn find_direct_conversation(&self, a: &str, b: &str) -> Result<Option<String>> {
        self.with_conn(|conn| find_direct(conn, a, b))
    }

    /// All conversation ids the user participates in, unordered.
    pub fn list_conversation_ids(&self, user_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT conversation_id FROM conversation_participants WHERE user_id = ?1",
            )?;
            let ids = stmt
                .query_map([user_id], |r| r.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(ids)
        })
    }

    /// Replace the mutable fields of a group conversation. `None` leaves a
    /// field untouched; a participant list replaces the whole set.
    pub fn update_conversation(
        &self,
        id: &str,
        name: Option<&str>,
        participants: Option<&[String]>,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            if let Some(name) = name {
                tx.execute("UPDATE conversations SET name = ?1 WHERE id = ?2", (name, id))?;
            }
            if let Some(participants) = participants {
                tx.execute(
                    "DELETE FROM conversation_participants WHERE conversation_id = ?1",
                    [id],
                )?;
                for user_id in participants {
                    tx.execute(
                        "INSERT OR IGNORE INTO conversation_participants (conversation_id, user_id) VALUES (?1, ?2)",
                        (id, user_id),
                    )?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Timestamp of the newest message, or the conversation's own
    /// created_at when it has no messages yet. `None` only for an unknown
    /// conversation.
    pub fn last_message_time(&self, conversation_id: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let ts = conn
                .query_row(
                    "SELECT COALESCE(
                        (SELECT MAX(created_at) FROM messages WHERE conversation_id = ?1),
                        (SELECT created_at FROM conversations WHERE id = ?1))",
                    [conversation_id],
                    |row| row.get::<_, Option<String>>(0),
                )
                .optional()?
                .flatten();
            Ok(ts)
        })
    }

    // -- Messages --

    /// Insert a message with its attachment sequence, atomically.
    pub fn insert_message(&self, row: &MessageRow, attachments: &[NewAttachment]) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, body, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![row.id, row.conversation_id, row.sender_id, row.body, row.created_at],
            )?;
            for (position, att) in attachments.iter().enumerate() {
                tx.execute(
                    "INSERT INTO attachments (message_id, position, kind, name, url) VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![row.id, position as i64, att.kind, att.name, att.url],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Messages with created_at strictly after `since` (or all of them),
    /// ascending by timestamp. `exclude_sender` drops one sender's
    /// messages, used by catch-up fetch to skip what the caller sent
    /// itself.
    pub fn fetch_messages_since(
        &self,
        conversation_id: &str,
        since: Option<&str>,
        exclude_sender: Option<&str>,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut sql = String::from(
                "SELECT id, conversation_id, sender_id, body, created_at
                 FROM messages WHERE conversation_id = ?1",
            );
            let mut params: Vec<&dyn rusqlite::types::ToSql> = vec![&conversation_id];

            if let Some(since) = since.as_ref() {
                params.push(since);
                sql.push_str(&format!(" AND created_at > ?{}", params.len()));
            }
            if let Some(sender) = exclude_sender.as_ref() {
                params.push(sender);
                sql.push_str(&format!(" AND sender_id <> ?{}", params.len()));
            }
            sql.push_str(" ORDER BY created_at ASC");

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params.as_slice(), |row| {
                    Ok(MessageRow {
                        id: row.get(0)?,
                        conversation_id: row.get(1)?,
                        sender_id: row.get(2)?,
                        body: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Batch-fetch attachments for a set of message ids, in stored order.
    pub fn get_attachments_for_messages(&self, message_ids: &[String]) -> Result<Vec<AttachmentRow>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> =
                (1..=message_ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT message_id, position, kind, name, url FROM attachments
                 WHERE message_id IN ({}) ORDER BY message_id, position",
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<&dyn rusqlite::types::ToSql> = message_ids
                .iter()
                .map(|id| id as &dyn rusqlite::types::ToSql)
                .collect();

            let rows = stmt
                .query_map(params.as_slice(), |row| {
                    Ok(AttachmentRow {
                        message_id: row.get(0)?,
                        position: row.get(1)?,
                        kind: row.get(2)?,
                        name: row.get(3)?,
                        url: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }
}

fn find_direct(conn: &Connection, a: &str, b: &str) -> Result<Option<String>> {
    let id = conn
        .query_row(
            "SELECT c.id FROM conversations c
             WHERE c.kind = 'direct'
               AND EXISTS (SELECT 1 FROM conversation_participants
                           WHERE conversation_id = c.id AND user_id = ?1)
               AND EXISTS (SELECT 1 FROM conversation_participants
                           WHERE conversation_id = c.id AND user_id = ?2)
               AND (SELECT COUNT(*) FROM conversation_participants
                    WHERE conversation_id = c.id) = 2",
            [a, b],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

fn insert_conversation_rows(conn: &Connection, row: &ConversationRow) -> Result<()> {
    conn.execute(
        "INSERT INTO conversations (id, kind, created_by, created_at, name) VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![row.id, row.kind, row.created_by, row.created_at, row.name],
    )?;
    for user_id in &row.participants {
        conn.execute(
            "INSERT OR IGNORE INTO conversation_participants (conversation_id, user_id) VALUES (?1, ?2)",
            (&row.id, user_id),
        )?;
    }
    Ok(())
}

fn query_user(conn: &Connection, sql: &str, key: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(sql)?;
    let row = stmt.query_row([key], map_user_row).optional()?;
    Ok(row)
}

fn map_user_row(row: &rusqlite::Row<'_>) -> std::result::Result<UserRow, rusqlite::Error> {
    Ok(UserRow {
        id: row.get(0)?,
        username: row.get(1)?,
        password: row.get(2)?,
        name: row.get(3)?,
        email: row.get(4)?,
        icon_url: row.get(5)?,
        created_at: row.get(6)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::format_ts;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn test_db() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn add_user(db: &Database, username: &str) -> String {
        let id = Uuid::new_v4().to_string();
        db.create_user(&id, username, "hash", username, None).unwrap();
        id
    }

    fn add_conversation(db: &Database, kind: &str, creator: &str, participants: &[&str]) -> String {
        let id = Uuid::new_v4().to_string();
        db.insert_conversation(&ConversationRow {
            id: id.clone(),
            kind: kind.into(),
            created_by: creator.into(),
            created_at: format_ts(Utc::now()),
            name: None,
            participants: participants.iter().map(|p| p.to_string()).collect(),
        })
        .unwrap();
        id
    }

    #[test]
    fn direct_conversation_lookup_is_exact_pair() {
        let db = test_db();
        let a = add_user(&db, "alice");
        let b = add_user(&db, "bob");
        let c = add_user(&db, "carol");

        // A group containing {a, b, c} must not satisfy a direct lookup.
        add_conversation(&db, "group", &a, &[&a, &b, &c]);
        assert!(db.find_direct_conversation(&a, &b).unwrap().is_none());

        let direct = add_conversation(&db, "direct", &a, &[&a, &b]);
        assert_eq!(db.find_direct_conversation(&a, &b).unwrap(), Some(direct.clone()));
        // Order of the pair is irrelevant.
        assert_eq!(db.find_direct_conversation(&b, &a).unwrap(), Some(direct));
        // A different pair finds nothing.
        assert!(db.find_direct_conversation(&a, &c).unwrap().is_none());
    }

    #[test]
    fn stored_email_round_trips() {
        let db = test_db();
        let id = Uuid::new_v4().to_string();
        db.create_user(&id, "alice", "hash", "Alice", Some("alice@example.com"))
            .unwrap();

        let user = db.get_user_by_id(&id).unwrap().unwrap();
        assert_eq!(user.email.as_deref(), Some("alice@example.com"));
        // And absent stays absent.
        let anon = add_user(&db, "bob");
        assert!(db.get_user_by_id(&anon).unwrap().unwrap().email.is_none());
    }

    #[test]
    fn racing_direct_creations_persist_exactly_one_pair() {
        let db = std::sync::Arc::new(test_db());
        let a = add_user(&db, "alice");
        let b = add_user(&db, "bob");

        // Two requests that both believe the pair is new race on the
        // atomic helper; exactly one insert may win.
        let results: Vec<Option<String>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let db = db.clone();
                    let a = a.clone();
                    let b = b.clone();
                    s.spawn(move || {
                        let row = ConversationRow {
                            id: Uuid::new_v4().to_string(),
                            kind: "direct".into(),
                            created_by: a.clone(),
                            created_at: format_ts(Utc::now()),
                            name: None,
                            participants: vec![a.clone(), b.clone()],
                        };
                        db.insert_direct_conversation(&row, &a, &b).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_none()).count(), 1);
        let winner = db.find_direct_conversation(&a, &b).unwrap().unwrap();
        assert!(results.contains(&Some(winner)));

        let direct_count: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM conversations WHERE kind = 'direct'",
                    [],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(direct_count, 1);
    }

    #[test]
    fn list_conversation_ids_covers_membership() {
        let db = test_db();
        let a = add_user(&db, "alice");
        let b = add_user(&db, "bob");
        let c = add_user(&db, "carol");

        let c1 = add_conversation(&db, "direct", &a, &[&a, &b]);
        let c2 = add_conversation(&db, "group", &a, &[&a, &b, &c]);

        let mut of_a = db.list_conversation_ids(&a).unwrap();
        of_a.sort();
        let mut expected = vec![c1, c2.clone()];
        expected.sort();
        assert_eq!(of_a, expected);

        assert_eq!(db.list_conversation_ids(&c).unwrap(), vec![c2]);
    }

    #[test]
    fn last_message_time_falls_back_to_created_at() {
        let db = test_db();
        let a = add_user(&db, "alice");
        let b = add_user(&db, "bob");
        let conv = add_conversation(&db, "direct", &a, &[&a, &b]);

        let created_at = db.get_conversation(&conv).unwrap().unwrap().created_at;
        assert_eq!(db.last_message_time(&conv).unwrap(), Some(created_at.clone()));

        let later = format_ts(Utc::now() + Duration::seconds(5));
        db.insert_message(
            &MessageRow {
                id: Uuid::new_v4().to_string(),
                conversation_id: conv.clone(),
                sender_id: a.clone(),
                body: "hi".into(),
                created_at: later.clone(),
            },
            &[],
        )
        .unwrap();

        assert_eq!(db.last_message_time(&conv).unwrap(), Some(later));
        assert_eq!(db.last_message_time("no-such-conversation").unwrap(), None);
    }

    #[test]
    fn fetch_messages_since_orders_filters_and_excludes() {
        let db = test_db();
        let a = add_user(&db, "alice");
        let b = add_user(&db, "bob");
        let conv = add_conversation(&db, "direct", &a, &[&a, &b]);

        let base = Utc::now();
        for (i, sender) in [(0i64, &a), (1, &b), (2, &a)] {
            db.insert_message(
                &MessageRow {
                    id: format!("m{}", i),
                    conversation_id: conv.clone(),
                    sender_id: sender.to_string(),
                    body: format!("msg {}", i),
                    created_at: format_ts(base + Duration::seconds(i)),
                },
                &[],
            )
            .unwrap();
        }

        let all = db.fetch_messages_since(&conv, None, None).unwrap();
        assert_eq!(
            all.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
            ["m0", "m1", "m2"]
        );

        // Strictly-after cutoff drops m0.
        let since = format_ts(base);
        let after = db.fetch_messages_since(&conv, Some(&since), None).unwrap();
        assert_eq!(after.len(), 2);
        assert_eq!(after[0].id, "m1");

        // Excluding alice keeps only bob's message.
        let theirs = db.fetch_messages_since(&conv, None, Some(&a)).unwrap();
        assert_eq!(theirs.len(), 1);
        assert_eq!(theirs[0].sender_id, b);
    }

    #[test]
    fn message_attachments_keep_source_order() {
        let db = test_db();
        let a = add_user(&db, "alice");
        let b = add_user(&db, "bob");
        let conv = add_conversation(&db, "direct", &a, &[&a, &b]);

        let msg_id = Uuid::new_v4().to_string();
        db.insert_message(
            &MessageRow {
                id: msg_id.clone(),
                conversation_id: conv,
                sender_id: a,
                body: "pics".into(),
                created_at: format_ts(Utc::now()),
            },
            &[
                NewAttachment { kind: "image".into(), name: "one.png".into(), url: "/files/one".into() },
                NewAttachment { kind: "audio".into(), name: "two.mp3".into(), url: "/files/two".into() },
            ],
        )
        .unwrap();

        let atts = db.get_attachments_for_messages(&[msg_id]).unwrap();
        assert_eq!(atts.len(), 2);
        assert_eq!((atts[0].position, atts[0].name.as_str()), (0, "one.png"));
        assert_eq!((atts[1].position, atts[1].kind.as_str()), (1, "audio"));
    }

    #[test]
    fn update_conversation_replaces_participant_set() {
        let db = test_db();
        let a = add_user(&db, "alice");
        let b = add_user(&db, "bob");
        let c = add_user(&db, "carol");
        let d = add_user(&db, "dave");
        let conv = add_conversation(&db, "group", &a, &[&a, &b, &c]);

        db.update_conversation(&conv, Some("renamed"), Some(&[a.clone(), b.clone(), d.clone()]))
            .unwrap();

        let row = db.get_conversation(&conv).unwrap().unwrap();
        assert_eq!(row.name.as_deref(), Some("renamed"));
        let mut got = row.participants;
        got.sort();
        let mut want = vec![a, b, d];
        want.sort();
        assert_eq!(got, want);
    }
}
