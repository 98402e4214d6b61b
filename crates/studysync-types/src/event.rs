//! Typed row-change events.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Collection, Operation};

/// A normalised row change.
///
/// `row` is the new record for inserts and updates and the old record (at
/// least its primary key) for deletes. Events are ephemeral: produced by the
/// normaliser and consumed once by the processor that owns the key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub collection: Collection,
    pub operation: Operation,
    pub row: Map<String, Value>,
    /// Server commit time, when the feed supplied one.
    #[serde(default)]
    pub committed_at: Option<DateTime<Utc>>,
    /// Local receive time.
    pub received_at: DateTime<Utc>,
}

impl ChangeEvent {
    /// Builds an event received now.
    pub fn new(collection: Collection, operation: Operation, row: Map<String, Value>) -> Self {
        Self {
            collection,
            operation,
            row,
            committed_at: None,
            received_at: Utc::now(),
        }
    }

    /// Returns a string column of the row.
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.row.get(name).and_then(Value::as_str)
    }

    /// Returns the row's primary key.
    pub fn row_id(&self) -> Option<&str> {
        self.str_field("id")
    }

    /// Decodes the row into a typed record.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.row.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Message;
    use serde_json::json;

    #[test]
    fn decode_message_row() {
        let Value::Object(row) = json!({
            "id": "m1",
            "client_id": "k1",
            "conversation_id": "c1",
            "sender_id": "u1",
            "body": "hi",
            "created_at": "2024-03-01T09:00:00.000000Z",
            "is_read": true
        }) else {
            unreachable!()
        };
        let event = ChangeEvent::new(Collection::Messages, Operation::Insert, row);
        assert_eq!(event.row_id(), Some("m1"));
        assert_eq!(event.str_field("conversation_id"), Some("c1"));
        let msg: Message = event.decode().unwrap();
        assert_eq!(msg.client_id.as_deref(), Some("k1"));
        assert!(msg.is_read);
    }
}
