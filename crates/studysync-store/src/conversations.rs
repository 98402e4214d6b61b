//! Conversation rows and derived summaries.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use studysync_types::{timestamp, Conversation, ConversationSummary, MessagePreview};

use crate::error::StoreError;
use crate::messages::map_row_to_message;
use crate::timestamp_column;

/// Parameters for creating a conversation.
#[derive(Debug, Clone)]
pub struct CreateConversationParams {
    pub id: String,
    pub participant_ids: Vec<String>,
}

/// Creates a conversation between exactly two participants.
pub fn create_conversation(
    conn: &Connection,
    params: &CreateConversationParams,
) -> Result<Conversation, StoreError> {
    if params.participant_ids.len() != 2 || params.participant_ids[0] == params.participant_ids[1]
    {
        return Err(StoreError::Invalid(format!(
            "conversation {} needs exactly two distinct participants",
            params.id
        )));
    }

    let now = timestamp::format(&Utc::now());
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO conversations (id, created_at, updated_at) VALUES (?1, ?2, ?2)",
        params![params.id, now],
    )?;
    for (position, user_id) in params.participant_ids.iter().enumerate() {
        tx.execute(
            "INSERT INTO conversation_participants (conversation_id, user_id, position)
             VALUES (?1, ?2, ?3)",
            params![params.id, user_id, position as i64],
        )?;
    }
    tx.commit()?;

    get_conversation(conn, &params.id)
}

/// Retrieves a conversation with its participants.
pub fn get_conversation(conn: &Connection, id: &str) -> Result<Conversation, StoreError> {
    let conversation = conn
        .query_row(
            "SELECT id, created_at, updated_at FROM conversations WHERE id = ?1",
            [id],
            map_row_to_conversation,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("conversation {id}")))?;
    with_participants(conn, conversation)
}

/// Lists the conversations a user takes part in, most recently updated first.
pub fn list_conversations_for_user(
    conn: &Connection,
    user_id: &str,
) -> Result<Vec<Conversation>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT c.id, c.created_at, c.updated_at
         FROM conversations c
         JOIN conversation_participants p ON p.conversation_id = c.id
         WHERE p.user_id = ?1
         ORDER BY c.updated_at DESC, c.id ASC",
    )?;
    let rows = stmt.query_map([user_id], map_row_to_conversation)?;

    let mut conversations = Vec::new();
    for row in rows {
        conversations.push(with_participants(conn, row?)?);
    }
    Ok(conversations)
}

/// Bumps a conversation's `updated_at`, never moving it backwards.
pub fn touch_conversation(
    conn: &Connection,
    id: &str,
    at: DateTime<Utc>,
) -> Result<Conversation, StoreError> {
    let count = conn.execute(
        "UPDATE conversations SET updated_at = MAX(updated_at, ?2) WHERE id = ?1",
        params![id, timestamp::format(&at)],
    )?;
    if count == 0 {
        return Err(StoreError::NotFound(format!("conversation {id}")));
    }
    get_conversation(conn, id)
}

/// Computes the list entry for a conversation as seen by `viewer_id`.
///
/// The last message and the unread count are read from the messages table,
/// which is the authoritative source for both.
pub fn conversation_summary(
    conn: &Connection,
    id: &str,
    viewer_id: &str,
) -> Result<ConversationSummary, StoreError> {
    let conversation = get_conversation(conn, id)?;

    let last_message = conn
        .query_row(
            "SELECT id, client_id, conversation_id, sender_id, body, created_at, is_read
             FROM messages WHERE conversation_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT 1",
            [id],
            map_row_to_message,
        )
        .optional()?;

    let unread_count: u32 = conn.query_row(
        "SELECT COUNT(*) FROM messages
         WHERE conversation_id = ?1 AND sender_id != ?2 AND is_read = 0",
        params![id, viewer_id],
        |row| row.get(0),
    )?;

    Ok(ConversationSummary {
        other_participant_id: conversation.other_participant(viewer_id).map(str::to_string),
        last_message: last_message.as_ref().map(MessagePreview::from),
        unread_count,
        updated_at: conversation.updated_at,
        participant_ids: conversation.participant_ids,
        id: conversation.id,
    })
}

fn with_participants(
    conn: &Connection,
    mut conversation: Conversation,
) -> Result<Conversation, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM conversation_participants
         WHERE conversation_id = ?1 ORDER BY position ASC",
    )?;
    let rows = stmt.query_map([&conversation.id], |row| row.get::<_, String>(0))?;
    for row in rows {
        conversation.participant_ids.push(row?);
    }
    Ok(conversation)
}

fn map_row_to_conversation(row: &Row) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        participant_ids: Vec::new(),
        created_at: timestamp_column(row, 1)?,
        updated_at: timestamp_column(row, 2)?,
    })
}
