//! Collaboration sessions and their annotations.

use chrono::{Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use studysync_types::{timestamp, Annotation, AnnotationKind, CollaborationSession};
use uuid::Uuid;

use crate::error::StoreError;
use crate::timestamp_column;

/// Parameters for creating a collaboration session.
#[derive(Debug, Clone)]
pub struct CreateSessionParams {
    pub id: String,
    pub title: String,
    pub document_content: String,
    pub participant_ids: Vec<String>,
}

/// Creates a collaboration session and enrols its participants.
pub fn create_session(
    conn: &Connection,
    params: &CreateSessionParams,
) -> Result<CollaborationSession, StoreError> {
    let now = timestamp::format(&Utc::now());
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO collab_sessions (id, title, document_content, updated_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![params.id, params.title, params.document_content, now],
    )?;
    for user_id in &params.participant_ids {
        tx.execute(
            "INSERT OR IGNORE INTO collab_participants (session_id, user_id, joined_at)
             VALUES (?1, ?2, ?3)",
            params![params.id, user_id, now],
        )?;
    }
    tx.commit()?;

    get_session(conn, &params.id)
}

/// Retrieves a session with its participants.
pub fn get_session(conn: &Connection, id: &str) -> Result<CollaborationSession, StoreError> {
    let mut session = conn
        .query_row(
            "SELECT id, document_content, updated_at, updated_by
             FROM collab_sessions WHERE id = ?1",
            [id],
            map_row_to_session,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("collaboration session {id}")))?;

    let mut stmt = conn.prepare(
        "SELECT user_id FROM collab_participants
         WHERE session_id = ?1 ORDER BY joined_at ASC, user_id ASC",
    )?;
    let rows = stmt.query_map([id], |row| row.get::<_, String>(0))?;
    for row in rows {
        session.participant_ids.push(row?);
    }
    Ok(session)
}

/// Overwrites a session's document content.
///
/// The new `updated_at` is the server clock, bumped past the previous value
/// if the clock has not advanced, so every save produces a strictly newer
/// content version. The read and the write share one write-locked
/// transaction: concurrent saves commit in version order and the stored row
/// always holds the newest version handed out.
pub fn save_content(
    conn: &Connection,
    session_id: &str,
    author_id: &str,
    content: &str,
) -> Result<CollaborationSession, StoreError> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let previous = get_session(&tx, session_id)?;
    let updated_at = Utc::now().max(previous.content_version + Duration::microseconds(1));

    tx.execute(
        "UPDATE collab_sessions
         SET document_content = ?2, updated_at = ?3, updated_by = ?4
         WHERE id = ?1",
        params![
            session_id,
            content,
            timestamp::format(&updated_at),
            author_id
        ],
    )?;

    let saved = get_session(&tx, session_id)?;
    tx.commit()?;
    Ok(saved)
}

/// Parameters for creating an annotation.
#[derive(Debug, Clone)]
pub struct CreateAnnotationParams {
    pub session_id: String,
    pub author_id: String,
    pub kind: AnnotationKind,
    pub payload: serde_json::Value,
}

/// Creates an annotation with a server-assigned id.
pub fn create_annotation(
    conn: &Connection,
    params: &CreateAnnotationParams,
) -> Result<Annotation, StoreError> {
    let kind = serde_json::to_value(&params.kind)?;
    let kind = kind
        .as_str()
        .ok_or_else(|| StoreError::Invalid("annotation kind must encode as a string".into()))?
        .to_string();
    let payload_json = serde_json::to_string(&params.payload)?;

    let row = conn.query_row(
        "INSERT INTO annotations (id, session_id, author_id, kind, payload_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         RETURNING id, session_id, author_id, kind, payload_json, created_at",
        params![
            Uuid::new_v4().to_string(),
            params.session_id,
            params.author_id,
            kind,
            payload_json,
            timestamp::format(&Utc::now()),
        ],
        map_row_to_annotation,
    )?;
    Ok(row)
}

/// Lists a session's annotations in creation order.
pub fn list_annotations(conn: &Connection, session_id: &str) -> Result<Vec<Annotation>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, session_id, author_id, kind, payload_json, created_at
         FROM annotations WHERE session_id = ?1
         ORDER BY created_at ASC, id ASC",
    )?;
    let rows = stmt.query_map([session_id], map_row_to_annotation)?;

    let mut annotations = Vec::new();
    for row in rows {
        annotations.push(row?);
    }
    Ok(annotations)
}

/// Deletes an annotation, returning the removed row.
pub fn delete_annotation(conn: &Connection, id: &str) -> Result<Annotation, StoreError> {
    conn.query_row(
        "DELETE FROM annotations WHERE id = ?1
         RETURNING id, session_id, author_id, kind, payload_json, created_at",
        [id],
        map_row_to_annotation,
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound(format!("annotation {id}")))
}

fn map_row_to_session(row: &Row) -> rusqlite::Result<CollaborationSession> {
    Ok(CollaborationSession {
        id: row.get(0)?,
        document_content: row.get(1)?,
        content_version: timestamp_column(row, 2)?,
        updated_by: row.get(3)?,
        participant_ids: Vec::new(),
    })
}

fn map_row_to_annotation(row: &Row) -> rusqlite::Result<Annotation> {
    let kind_str: String = row.get(3)?;
    let kind = serde_json::from_value(serde_json::Value::String(kind_str)).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let payload_str: String = row.get(4)?;
    let payload = serde_json::from_str(&payload_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Annotation {
        id: row.get(0)?,
        session_id: row.get(1)?,
        author_id: row.get(2)?,
        kind,
        payload,
        created_at: timestamp_column(row, 5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::setup_db;
    use serde_json::json;

    fn setup_session(conn: &Connection) -> CollaborationSession {
        create_session(
            conn,
            &CreateSessionParams {
                id: "s1".to_string(),
                title: "Biology notes".to_string(),
                document_content: "draft".to_string(),
                participant_ids: vec!["alice".to_string(), "bob".to_string()],
            },
        )
        .expect("create session failed")
    }

    #[test]
    fn test_save_content_bumps_version() {
        let conn = setup_db();
        let created = setup_session(&conn);
        assert_eq!(created.document_content, "draft");
        assert_eq!(created.participant_ids.len(), 2);

        let first = save_content(&conn, "s1", "alice", "v1").expect("save failed");
        let second = save_content(&conn, "s1", "bob", "v2").expect("save failed");
        assert!(first.content_version > created.content_version);
        assert!(second.content_version > first.content_version);
        assert_eq!(second.document_content, "v2");
        assert_eq!(second.updated_by.as_deref(), Some("bob"));

        assert!(matches!(
            save_content(&conn, "missing", "bob", "v3"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_annotation_create_list_delete() {
        let conn = setup_db();
        setup_session(&conn);

        let highlight = create_annotation(
            &conn,
            &CreateAnnotationParams {
                session_id: "s1".to_string(),
                author_id: "alice".to_string(),
                kind: AnnotationKind::Highlight,
                payload: json!({"from": 0, "to": 5}),
            },
        )
        .expect("create annotation failed");
        let comment = create_annotation(
            &conn,
            &CreateAnnotationParams {
                session_id: "s1".to_string(),
                author_id: "bob".to_string(),
                kind: AnnotationKind::Comment,
                payload: json!({"text": "source?"}),
            },
        )
        .expect("create annotation failed");

        let listed = list_annotations(&conn, "s1").expect("list failed");
        assert_eq!(listed.len(), 2);
        let stored = listed
            .iter()
            .find(|a| a.id == highlight.id)
            .expect("highlight should be listed");
        assert_eq!(stored.payload["to"], 5);
        assert_eq!(stored.kind, AnnotationKind::Highlight);

        let removed = delete_annotation(&conn, &highlight.id).expect("delete failed");
        assert_eq!(removed.id, highlight.id);
        let listed = list_annotations(&conn, "s1").expect("list failed");
        assert_eq!(listed, vec![comment]);
    }
}
