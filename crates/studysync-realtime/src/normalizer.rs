//! Turns raw change notifications into typed [`ChangeEvent`]s.
//!
//! The upstream feed is not schema-guaranteed, so every field is checked and
//! anything that cannot be interpreted is dropped with a warning. Nothing in
//! here holds state or panics on input.

use serde_json::Value;
use studysync_types::{timestamp, ChangeEvent, Collection, Operation};

use crate::SyncError;

/// Normalizes a notification, logging and discarding malformed input.
pub fn normalize(raw: &Value) -> Option<ChangeEvent> {
    match try_normalize(raw) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!("dropping change notification: {}", e);
            None
        }
    }
}

/// Normalizes a notification, reporting why it was rejected.
///
/// Inserts and updates carry the `new` row, deletes the `old` row; either
/// way the row must be an object with a non-empty string `id`.
pub fn try_normalize(raw: &Value) -> Result<ChangeEvent, SyncError> {
    let malformed = |reason: String| SyncError::MalformedEvent(reason);

    let payload = raw
        .as_object()
        .ok_or_else(|| malformed("payload is not an object".into()))?;

    if let Some(errors) = payload.get("errors").filter(|e| !e.is_null()) {
        return Err(malformed(format!("feed reported errors: {errors}")));
    }

    let table = payload
        .get("table")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("missing table".into()))?;
    let collection: Collection = table.parse().map_err(|e| malformed(format!("{e}")))?;

    let event_type = payload
        .get("eventType")
        .or_else(|| payload.get("type"))
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("missing eventType".into()))?;
    let operation: Operation = event_type.parse().map_err(|e| malformed(format!("{e}")))?;

    let side = match operation {
        Operation::Delete => "old",
        Operation::Insert | Operation::Update => "new",
    };
    let row = match payload.get(side) {
        Some(Value::Object(row)) => row.clone(),
        _ => {
            return Err(malformed(format!(
                "{operation} on {collection} has no {side} row"
            )))
        }
    };
    match row.get("id").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => {}
        _ => {
            return Err(malformed(format!(
                "{operation} on {collection} has a row without an id"
            )))
        }
    }

    let mut event = ChangeEvent::new(collection, operation, row);
    event.committed_at = payload
        .get("commit_timestamp")
        .and_then(Value::as_str)
        .and_then(|raw| match timestamp::parse(raw) {
            Ok(ts) => Some(ts),
            Err(e) => {
                tracing::debug!(raw, "ignoring unparseable commit_timestamp: {}", e);
                None
            }
        });
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn insert_takes_the_new_row() {
        let event = normalize(&json!({
            "schema": "public",
            "table": "messages",
            "eventType": "INSERT",
            "new": {"id": "m1", "conversation_id": "c1"},
            "old": {},
            "commit_timestamp": "2024-03-01T09:00:00.000000Z",
            "errors": null
        }))
        .expect("should normalize");
        assert_eq!(event.collection, Collection::Messages);
        assert_eq!(event.operation, Operation::Insert);
        assert_eq!(event.row_id(), Some("m1"));
        assert!(event.committed_at.is_some());
    }

    #[test]
    fn delete_takes_the_old_row() {
        let event = normalize(&json!({
            "table": "annotations",
            "eventType": "delete",
            "new": {},
            "old": {"id": "a1"}
        }))
        .expect("should normalize");
        assert_eq!(event.operation, Operation::Delete);
        assert_eq!(event.row_id(), Some("a1"));
        assert_eq!(event.committed_at, None);
    }

    #[test]
    fn malformed_payloads_are_dropped() {
        let cases = [
            json!("not an object"),
            json!({"eventType": "INSERT", "new": {"id": "m1"}}),
            json!({"table": "profiles", "eventType": "INSERT", "new": {"id": "p1"}}),
            json!({"table": "messages", "eventType": "UPSERT", "new": {"id": "m1"}}),
            json!({"table": "messages", "eventType": "INSERT", "new": null}),
            json!({"table": "messages", "eventType": "INSERT", "new": {"body": "x"}}),
            json!({"table": "messages", "eventType": "DELETE", "new": {"id": "m1"}, "old": {}}),
            json!({"table": "messages", "eventType": "INSERT", "new": {"id": "m1"}, "errors": ["boom"]}),
        ];
        for raw in cases {
            assert!(normalize(&raw).is_none(), "accepted {raw}");
        }
    }

    #[test]
    fn bad_commit_timestamp_is_not_fatal() {
        let event = try_normalize(&json!({
            "table": "collab_sessions",
            "eventType": "UPDATE",
            "new": {"id": "s1"},
            "commit_timestamp": "later"
        }))
        .expect("should normalize");
        assert_eq!(event.committed_at, None);
    }
}
