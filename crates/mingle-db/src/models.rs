//! Database row types — these map directly to SQLite rows.
//! Distinct from the mingle-types API models to keep the DB layer
//! independent.

use chrono::{DateTime, SecondsFormat, Utc};

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub name: String,
    pub email: Option<String>,
    pub icon_url: Option<String>,
    pub created_at: String,
}

pub struct ConversationRow {
    pub id: String,
    pub kind: String,
    pub created_by: String,
    pub created_at: String,
    pub name: Option<String>,
    pub participants: Vec<String>,
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub body: String,
    pub created_at: String,
}

pub struct AttachmentRow {
    pub message_id: String,
    pub position: i64,
    pub kind: String,
    pub name: String,
    pub url: String,
}

/// Fixed-width UTC RFC 3339 with microseconds, so lexicographic comparison
/// in SQL matches chronological order.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(s: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_round_trip_and_sort_lexicographically() {
        // format_ts truncates to microseconds, so normalize first.
        let a = parse_ts(&format_ts(Utc::now())).unwrap();
        let b = a + chrono::Duration::microseconds(1);

        let fa = format_ts(a);
        let fb = format_ts(b);
        assert!(fa < fb);
        assert_eq!(parse_ts(&fa).unwrap(), a);
        assert_eq!(parse_ts(&fb).unwrap(), b);
    }
}
