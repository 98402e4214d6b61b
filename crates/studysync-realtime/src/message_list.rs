//! Ordered, deduplicated message list for one conversation.
//!
//! This is the merge core of the message stream: it applies normalized
//! change events and local optimistic writes to an in-memory list while
//! keeping three properties:
//!
//! - entries are sorted by `(created_at, id)`;
//! - no id appears twice;
//! - a pending local message and its confirmed copy collapse to one entry.
//!
//! Everything here is synchronous and free of I/O.

use chrono::Utc;
use studysync_types::{ChangeEvent, ClientState, Collection, Message, Operation};
use uuid::Uuid;

/// Prefix of ids assigned to optimistic entries.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// What applying an event did to the list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Merge {
    /// A new entry was inserted.
    Inserted(String),
    /// A pending entry was collapsed into its confirmed copy.
    Confirmed { local_id: String, id: String },
    /// An existing entry's fields were replaced.
    Updated(String),
    /// An entry was removed.
    Removed(String),
    /// Nothing changed (duplicate delivery, unknown delete, foreign row).
    Ignored,
}

impl Merge {
    /// True if the list changed.
    pub fn changed(&self) -> bool {
        !matches!(self, Merge::Ignored)
    }
}

#[derive(Debug, Clone)]
pub struct MessageList {
    conversation_id: String,
    entries: Vec<Message>,
    match_window: chrono::Duration,
}

impl MessageList {
    pub fn new(conversation_id: impl Into<String>, match_window: chrono::Duration) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            entries: Vec::new(),
            match_window,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.position(id).map(|i| &self.entries[i])
    }

    /// Confirmed, unread messages not sent by `self_id`.
    pub fn unread_count(&self, self_id: &str) -> u32 {
        self.entries
            .iter()
            .filter(|m| is_unread_for(m, self_id))
            .count() as u32
    }

    /// Applies a normalized change event.
    ///
    /// Events for other collections or conversations, and rows that cannot
    /// be decoded, are ignored.
    pub fn apply(&mut self, event: &ChangeEvent) -> Merge {
        if event.collection != Collection::Messages {
            return Merge::Ignored;
        }
        if let Some(conversation_id) = event.str_field("conversation_id") {
            if conversation_id != self.conversation_id {
                tracing::debug!(
                    conversation_id = %self.conversation_id,
                    foreign = conversation_id,
                    "ignoring message event for another conversation"
                );
                return Merge::Ignored;
            }
        }

        match event.operation {
            Operation::Delete => match event.row_id() {
                Some(id) => self.remove(id),
                None => Merge::Ignored,
            },
            Operation::Insert | Operation::Update => match event.decode::<Message>() {
                Ok(mut message) => {
                    message.client_state = ClientState::Confirmed;
                    if event.operation == Operation::Insert {
                        self.insert(message)
                    } else {
                        self.update(message)
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        conversation_id = %self.conversation_id,
                        "dropping undecodable message row: {}",
                        e
                    );
                    Merge::Ignored
                }
            },
        }
    }

    /// Merges a confirmed message delivered as an insert.
    pub fn insert(&mut self, message: Message) -> Merge {
        if self.position(&message.id).is_some() {
            return Merge::Ignored;
        }

        if let Some(idx) = self.pending_match(&message) {
            let local_id = std::mem::replace(&mut self.entries[idx], message).id;
            let id = self.entries[idx].id.clone();
            self.restore_order(idx);
            return Merge::Confirmed { local_id, id };
        }

        let id = message.id.clone();
        self.insert_sorted(message);
        Merge::Inserted(id)
    }

    /// Merges a confirmed message delivered as an update. An update for an
    /// unknown id is an out-of-order insert.
    pub fn update(&mut self, message: Message) -> Merge {
        let Some(idx) = self.position(&message.id) else {
            return self.insert(message);
        };
        if self.entries[idx] == message {
            return Merge::Ignored;
        }
        let id = message.id.clone();
        self.entries[idx] = message;
        self.restore_order(idx);
        Merge::Updated(id)
    }

    /// Removes an entry by id.
    pub fn remove(&mut self, id: &str) -> Merge {
        match self.position(id) {
            Some(idx) => {
                self.entries.remove(idx);
                Merge::Removed(id.to_string())
            }
            None => Merge::Ignored,
        }
    }

    /// Appends an optimistic entry for a message about to be written.
    ///
    /// The entry gets a `local-` id and a fresh idempotency id in
    /// `client_id`; the confirmed row carries the same `client_id` back.
    pub fn stage(&mut self, sender_id: &str, body: &str) -> Message {
        let client_id = Uuid::new_v4().to_string();
        let pending = Message {
            id: format!("{LOCAL_ID_PREFIX}{client_id}"),
            client_id: Some(client_id),
            conversation_id: self.conversation_id.clone(),
            sender_id: sender_id.to_string(),
            body: body.to_string(),
            created_at: Utc::now(),
            is_read: false,
            client_state: ClientState::Pending,
        };
        self.insert_sorted(pending.clone());
        pending
    }

    /// Drops a pending entry whose write failed. Confirmed entries are
    /// never touched.
    pub fn discard_pending(&mut self, local_id: &str) -> bool {
        match self.position(local_id) {
            Some(idx) if self.entries[idx].is_pending() => {
                self.entries.remove(idx);
                true
            }
            _ => false,
        }
    }

    /// Marks every observed unread message from others as read and returns
    /// their ids.
    pub fn mark_read_locally(&mut self, self_id: &str) -> Vec<String> {
        let mut ids = Vec::new();
        for message in &mut self.entries {
            if is_unread_for(message, self_id) {
                message.is_read = true;
                ids.push(message.id.clone());
            }
        }
        ids
    }

    /// Reverts [`MessageList::mark_read_locally`] for the given ids.
    pub fn restore_unread(&mut self, ids: &[String]) {
        for message in &mut self.entries {
            if ids.contains(&message.id) {
                message.is_read = false;
            }
        }
    }

    /// Replaces confirmed state with an authoritative snapshot.
    ///
    /// Pending entries survive unless the snapshot already contains their
    /// confirmed copy.
    pub fn replace_with(&mut self, rows: Vec<Message>) {
        self.entries.retain(Message::is_pending);
        for mut row in rows {
            if row.conversation_id != self.conversation_id {
                continue;
            }
            row.client_state = ClientState::Confirmed;
            match self.position(&row.id) {
                Some(idx) => self.entries[idx] = row,
                None => {
                    self.insert(row);
                }
            }
        }
        self.entries.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|m| m.id == id)
    }

    fn pending_match(&self, confirmed: &Message) -> Option<usize> {
        let pending = self.entries.iter().enumerate().filter(|(_, m)| m.is_pending());
        match confirmed.client_id.as_deref() {
            Some(client_id) => pending
                .filter(|(_, m)| m.client_id.as_deref() == Some(client_id))
                .map(|(idx, _)| idx)
                .next(),
            // Rows written without an idempotency id fall back to content
            // and time matching.
            None => pending
                .filter(|(_, m)| {
                    m.conversation_id == confirmed.conversation_id
                        && m.sender_id == confirmed.sender_id
                        && m.body == confirmed.body
                        && (m.created_at - confirmed.created_at).abs() <= self.match_window
                })
                .map(|(idx, _)| idx)
                .next(),
        }
    }

    fn insert_sorted(&mut self, message: Message) {
        let idx = self
            .entries
            .partition_point(|m| m.sort_key() <= message.sort_key());
        self.entries.insert(idx, message);
    }

    /// Moves the entry at `idx` only if it now breaks the sort order.
    fn restore_order(&mut self, idx: usize) {
        let key = self.entries[idx].sort_key();
        let before_ok = idx == 0 || self.entries[idx - 1].sort_key() <= key;
        let after_ok = idx + 1 >= self.entries.len() || key <= self.entries[idx + 1].sort_key();
        if before_ok && after_ok {
            return;
        }
        let message = self.entries.remove(idx);
        self.insert_sorted(message);
    }
}

fn is_unread_for(message: &Message, self_id: &str) -> bool {
    !message.is_pending() && !message.is_read && message.sender_id != self_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone};
    use serde_json::{json, Value};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn confirmed(id: &str, sender: &str, body: &str, secs: i64) -> Message {
        Message {
            id: id.to_string(),
            client_id: None,
            conversation_id: "c1".to_string(),
            sender_id: sender.to_string(),
            body: body.to_string(),
            created_at: at(secs),
            is_read: false,
            client_state: ClientState::Confirmed,
        }
    }

    fn list() -> MessageList {
        MessageList::new("c1", Duration::seconds(30))
    }

    fn event(operation: Operation, row: Value) -> ChangeEvent {
        let Value::Object(row) = row else {
            panic!("row must be an object");
        };
        ChangeEvent::new(Collection::Messages, operation, row)
    }

    fn ids(list: &MessageList) -> Vec<&str> {
        list.messages().iter().map(|m| m.id.as_str()).collect()
    }

    fn assert_sorted_and_unique(list: &MessageList) {
        let keys: Vec<_> = list.messages().iter().map(Message::sort_key).collect();
        assert!(keys.windows(2).all(|w| w[0] < w[1]), "unsorted or duplicate: {keys:?}");
    }

    #[test]
    fn duplicate_insert_is_applied_once() {
        let mut list = list();
        let row = json!({
            "id": "a", "conversation_id": "c1", "sender_id": "u2",
            "body": "hello", "created_at": "2024-03-01T09:00:01Z", "is_read": false
        });
        assert_eq!(
            list.apply(&event(Operation::Insert, row.clone())),
            Merge::Inserted("a".to_string())
        );
        assert_eq!(list.apply(&event(Operation::Insert, row)), Merge::Ignored);
        assert_eq!(ids(&list), ["a"]);
    }

    #[test]
    fn out_of_order_inserts_stay_sorted() {
        let mut list = list();
        for (id, secs) in [("m3", 3), ("m1", 1), ("m5", 5), ("m2", 2), ("m4", 4)] {
            list.insert(confirmed(id, "u2", id, secs));
        }
        assert_eq!(ids(&list), ["m1", "m2", "m3", "m4", "m5"]);

        // Equal timestamps order by id.
        list.insert(confirmed("m2b", "u2", "tie", 2));
        list.insert(confirmed("m2a", "u2", "tie", 2));
        assert_eq!(ids(&list), ["m1", "m2", "m2a", "m2b", "m3", "m4", "m5"]);
        assert_sorted_and_unique(&list);
    }

    #[test]
    fn pending_collapses_into_confirmed_by_client_id() {
        let mut list = list();
        list.insert(confirmed("m0", "u2", "earlier", -3600));
        let pending = list.stage("me", "hi");
        assert!(pending.id.starts_with(LOCAL_ID_PREFIX));
        assert_eq!(list.len(), 2);

        let mut server = confirmed("srv-1", "me", "hi", 0);
        server.created_at = pending.created_at;
        server.client_id = pending.client_id.clone();
        assert_eq!(
            list.insert(server.clone()),
            Merge::Confirmed {
                local_id: pending.id.clone(),
                id: "srv-1".to_string()
            }
        );
        assert_eq!(ids(&list), ["m0", "srv-1"]);
        assert!(!list.messages()[1].is_pending());

        // Redelivery after the collapse changes nothing.
        assert_eq!(list.insert(server), Merge::Ignored);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn confirmed_copy_is_moved_only_when_order_requires_it() {
        let mut list = list();
        let pending = list.stage("me", "hi");
        // A message from the other side lands after the pending copy...
        let mut later = confirmed("m9", "u2", "yo", 0);
        later.created_at = pending.created_at + Duration::seconds(5);
        list.insert(later);

        // ...but the server stamped ours even later, so it has to move.
        let mut server = confirmed("srv-1", "me", "hi", 0);
        server.client_id = pending.client_id.clone();
        server.created_at = pending.created_at + Duration::seconds(10);
        list.insert(server);
        assert_eq!(ids(&list), ["m9", "srv-1"]);
        assert_sorted_and_unique(&list);
    }

    #[test]
    fn fallback_match_uses_content_and_window() {
        let mut list = list();
        let pending = list.stage("me", "see you");

        let mut far = confirmed("srv-far", "me", "see you", 0);
        far.created_at = pending.created_at + Duration::seconds(120);
        assert_eq!(list.insert(far), Merge::Inserted("srv-far".to_string()));
        assert!(list.get(&pending.id).is_some());

        let mut near = confirmed("srv-near", "me", "see you", 0);
        near.created_at = pending.created_at + Duration::seconds(2);
        assert!(matches!(list.insert(near), Merge::Confirmed { .. }));
        assert!(list.get(&pending.id).is_none());
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn foreign_client_id_does_not_fall_back_to_content() {
        let mut list = list();
        let pending = list.stage("me", "ok");
        let mut other_device = confirmed("srv-x", "me", "ok", 0);
        other_device.created_at = pending.created_at;
        other_device.client_id = Some("someone-else".to_string());
        assert!(matches!(list.insert(other_device), Merge::Inserted(_)));
        assert!(list.get(&pending.id).is_some());
    }

    #[test]
    fn update_replaces_or_inserts() {
        let mut list = list();
        list.insert(confirmed("m1", "u2", "one", 1));

        let mut read = confirmed("m1", "u2", "one", 1);
        read.is_read = true;
        assert_eq!(list.update(read.clone()), Merge::Updated("m1".to_string()));
        assert!(list.messages()[0].is_read);
        assert_eq!(list.update(read), Merge::Ignored);

        assert_eq!(
            list.update(confirmed("m0", "u2", "zero", 0)),
            Merge::Inserted("m0".to_string())
        );
        assert_eq!(ids(&list), ["m0", "m1"]);
    }

    #[test]
    fn delete_removes_known_and_ignores_unknown() {
        let mut list = list();
        list.insert(confirmed("m1", "u2", "one", 1));
        assert_eq!(
            list.apply(&event(Operation::Delete, json!({"id": "m1"}))),
            Merge::Removed("m1".to_string())
        );
        assert_eq!(
            list.apply(&event(Operation::Delete, json!({"id": "m1"}))),
            Merge::Ignored
        );
        assert!(list.is_empty());
    }

    #[test]
    fn foreign_and_undecodable_rows_are_ignored() {
        let mut list = list();
        let foreign = json!({
            "id": "x", "conversation_id": "c2", "sender_id": "u2",
            "body": "hi", "created_at": "2024-03-01T09:00:00Z"
        });
        assert_eq!(list.apply(&event(Operation::Insert, foreign)), Merge::Ignored);
        let broken = json!({"id": "y", "conversation_id": "c1", "created_at": "soon"});
        assert_eq!(list.apply(&event(Operation::Insert, broken)), Merge::Ignored);
        assert!(list.is_empty());
    }

    #[test]
    fn mark_read_locally_skips_own_pending_and_read() {
        let mut list = list();
        list.insert(confirmed("m1", "u2", "one", 1));
        let mut already = confirmed("m2", "u2", "two", 2);
        already.is_read = true;
        list.insert(already);
        list.insert(confirmed("m3", "me", "three", 3));
        list.stage("me", "four");
        assert_eq!(list.unread_count("me"), 1);

        let ids = list.mark_read_locally("me");
        assert_eq!(ids, ["m1"]);
        assert_eq!(list.unread_count("me"), 0);
        assert!(list.mark_read_locally("me").is_empty());

        list.restore_unread(&ids);
        assert_eq!(list.unread_count("me"), 1);
    }

    #[test]
    fn snapshot_keeps_unconfirmed_pending() {
        let mut list = list();
        list.insert(confirmed("gone", "u2", "deleted upstream", 0));
        let confirmed_pending = list.stage("me", "a");
        let still_pending = list.stage("me", "b");

        let mut server = confirmed("srv-a", "me", "a", 0);
        server.client_id = confirmed_pending.client_id.clone();
        server.created_at = confirmed_pending.created_at - Duration::seconds(1);
        list.replace_with(vec![confirmed("m1", "u2", "one", -10), server]);

        assert_eq!(ids(&list), ["m1", "srv-a", still_pending.id.as_str()]);
        assert_sorted_and_unique(&list);
    }

    #[test]
    fn discard_pending_leaves_confirmed_alone() {
        let mut list = list();
        list.insert(confirmed("m1", "u2", "one", 1));
        let pending = list.stage("me", "draft");
        assert!(!list.discard_pending("m1"));
        assert!(list.discard_pending(&pending.id));
        assert!(!list.discard_pending(&pending.id));
        assert_eq!(ids(&list), ["m1"]);
    }
}
