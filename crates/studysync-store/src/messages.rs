//! Message rows.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use studysync_types::{timestamp, ClientState, Message};
use uuid::Uuid;

use crate::error::StoreError;
use crate::timestamp_column;

/// Parameters for creating a new message.
#[derive(Debug, Clone)]
pub struct CreateMessageParams {
    /// Client-generated idempotency id, round-tripped into the stored row.
    pub client_id: Option<String>,
    pub conversation_id: String,
    pub sender_id: String,
    pub body: String,
}

/// Result of [`create_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedMessage {
    pub message: Message,
    /// False when the idempotency id matched an existing row and nothing was
    /// written.
    pub inserted: bool,
}

/// Creates a message with a server-assigned id and timestamp.
///
/// A retried write carrying an already stored `client_id` returns the stored
/// row instead of inserting a duplicate. `created_at` is strictly increasing
/// within a conversation.
pub fn create_message(
    conn: &Connection,
    params: &CreateMessageParams,
) -> Result<CreatedMessage, StoreError> {
    if let Some(client_id) = &params.client_id {
        if let Some(existing) = get_message_by_client_id(conn, client_id)? {
            return Ok(CreatedMessage {
                message: existing,
                inserted: false,
            });
        }
    }

    let created_at = next_created_at(conn, &params.conversation_id)?;
    let message = conn.query_row(
        "INSERT INTO messages (id, client_id, conversation_id, sender_id, body, created_at, is_read)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)
         RETURNING id, client_id, conversation_id, sender_id, body, created_at, is_read",
        params![
            Uuid::new_v4().to_string(),
            params.client_id,
            params.conversation_id,
            params.sender_id,
            params.body,
            timestamp::format(&created_at),
        ],
        map_row_to_message,
    )?;

    Ok(CreatedMessage {
        message,
        inserted: true,
    })
}

/// Retrieves a message by id.
pub fn get_message(conn: &Connection, id: &str) -> Result<Message, StoreError> {
    conn.query_row(
        "SELECT id, client_id, conversation_id, sender_id, body, created_at, is_read
         FROM messages WHERE id = ?1",
        [id],
        map_row_to_message,
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound(format!("message {id}")))
}

/// Retrieves a message by its client idempotency id.
pub fn get_message_by_client_id(
    conn: &Connection,
    client_id: &str,
) -> Result<Option<Message>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT id, client_id, conversation_id, sender_id, body, created_at, is_read
             FROM messages WHERE client_id = ?1",
            [client_id],
            map_row_to_message,
        )
        .optional()?)
}

/// Lists every message of a conversation, oldest first (ties by id).
pub fn list_messages(conn: &Connection, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, client_id, conversation_id, sender_id, body, created_at, is_read
         FROM messages WHERE conversation_id = ?1
         ORDER BY created_at ASC, id ASC",
    )?;
    let rows = stmt.query_map([conversation_id], map_row_to_message)?;

    let mut messages = Vec::new();
    for row in rows {
        messages.push(row?);
    }
    Ok(messages)
}

/// Marks the given messages read for `reader_id`.
///
/// Only unread messages of the conversation that were not sent by the reader
/// are touched; the rows that actually changed are returned so the caller can
/// publish one update per row. Ids the reader has not seen are never passed
/// in, so messages that arrive concurrently stay unread.
pub fn mark_read(
    conn: &Connection,
    conversation_id: &str,
    reader_id: &str,
    message_ids: &[String],
) -> Result<Vec<Message>, StoreError> {
    if message_ids.is_empty() {
        return Ok(Vec::new());
    }
    let ids_json = serde_json::to_string(message_ids)?;

    let mut stmt = conn.prepare(
        "UPDATE messages SET is_read = 1
         WHERE conversation_id = ?1
           AND sender_id != ?2
           AND is_read = 0
           AND id IN (SELECT value FROM json_each(?3))
         RETURNING id, client_id, conversation_id, sender_id, body, created_at, is_read",
    )?;
    let rows = stmt.query_map(params![conversation_id, reader_id, ids_json], map_row_to_message)?;

    let mut updated = Vec::new();
    for row in rows {
        updated.push(row?);
    }
    updated.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    Ok(updated)
}

/// Deletes a message, returning the removed row.
pub fn delete_message(conn: &Connection, id: &str) -> Result<Message, StoreError> {
    conn.query_row(
        "DELETE FROM messages WHERE id = ?1
         RETURNING id, client_id, conversation_id, sender_id, body, created_at, is_read",
        [id],
        map_row_to_message,
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound(format!("message {id}")))
}

fn next_created_at(conn: &Connection, conversation_id: &str) -> Result<DateTime<Utc>, StoreError> {
    let now = Utc::now();
    let latest: Option<String> = conn.query_row(
        "SELECT MAX(created_at) FROM messages WHERE conversation_id = ?1",
        [conversation_id],
        |row| row.get(0),
    )?;
    let Some(latest) = latest else {
        return Ok(now);
    };
    let latest = timestamp::parse(&latest).map_err(|source| StoreError::Timestamp {
        value: latest.clone(),
        source,
    })?;
    Ok(now.max(latest + Duration::microseconds(1)))
}

pub(crate) fn map_row_to_message(row: &Row) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        client_id: row.get(1)?,
        conversation_id: row.get(2)?,
        sender_id: row.get(3)?,
        body: row.get(4)?,
        created_at: timestamp_column(row, 5)?,
        is_read: row.get(6)?,
        client_state: ClientState::Confirmed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversations::{create_conversation, CreateConversationParams};
    use crate::test_support::setup_db;

    fn setup_conversation() -> Connection {
        let conn = setup_db();
        create_conversation(
            &conn,
            &CreateConversationParams {
                id: "c1".to_string(),
                participant_ids: vec!["alice".to_string(), "bob".to_string()],
            },
        )
        .expect("create conversation failed");
        conn
    }

    fn send(conn: &Connection, sender: &str, body: &str, client_id: Option<&str>) -> CreatedMessage {
        create_message(
            conn,
            &CreateMessageParams {
                client_id: client_id.map(str::to_string),
                conversation_id: "c1".to_string(),
                sender_id: sender.to_string(),
                body: body.to_string(),
            },
        )
        .expect("create message failed")
    }

    #[test]
    fn test_message_lifecycle() {
        let conn = setup_conversation();
        let first = send(&conn, "alice", "hello", Some("k1")).message;
        let second = send(&conn, "bob", "hi back", None).message;

        assert!(first.created_at < second.created_at);
        assert_eq!(first.client_id.as_deref(), Some("k1"));
        assert_eq!(get_message(&conn, &first.id).expect("get failed"), first);

        let listed = list_messages(&conn, "c1").expect("list failed");
        assert_eq!(listed, vec![first.clone(), second]);

        let removed = delete_message(&conn, &first.id).expect("delete failed");
        assert_eq!(removed.id, first.id);
        assert!(matches!(
            delete_message(&conn, &first.id),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_retried_write_is_idempotent() {
        let conn = setup_conversation();
        let original = send(&conn, "alice", "hello", Some("k1"));
        let retry = send(&conn, "alice", "hello", Some("k1"));

        assert!(original.inserted);
        assert!(!retry.inserted);
        assert_eq!(retry.message, original.message);
        assert_eq!(list_messages(&conn, "c1").expect("list failed").len(), 1);
    }

    #[test]
    fn test_mark_read_only_touches_listed_messages_from_others() {
        let conn = setup_conversation();
        let from_bob_1 = send(&conn, "bob", "one", None).message;
        let from_bob_2 = send(&conn, "bob", "two", None).message;
        let from_alice = send(&conn, "alice", "three", None).message;
        let unseen = send(&conn, "bob", "four", None).message;

        let ids = vec![
            from_bob_1.id.clone(),
            from_bob_2.id.clone(),
            from_alice.id.clone(),
        ];
        let updated = mark_read(&conn, "c1", "alice", &ids).expect("mark read failed");
        let updated_ids: Vec<&str> = updated.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(updated_ids, [from_bob_1.id.as_str(), from_bob_2.id.as_str()]);
        assert!(updated.iter().all(|m| m.is_read));

        assert!(!get_message(&conn, &unseen.id).expect("get failed").is_read);
        assert!(!get_message(&conn, &from_alice.id).expect("get failed").is_read);

        // Second call finds nothing left to update.
        let again = mark_read(&conn, "c1", "alice", &ids).expect("mark read failed");
        assert!(again.is_empty());
    }
}
