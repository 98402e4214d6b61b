//! Row types for the four synchronised collections.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a message has been confirmed by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    /// Sent optimistically; waiting for the feed to deliver the stored row.
    Pending,
    /// Stored by the backend.
    #[default]
    Confirmed,
}

/// A chat message.
///
/// Identity is `id`. Locally sent messages start with a `local-` id and a
/// `client_id` (idempotency id) that the backend stores alongside the real
/// id, so the confirmed row can be matched back to the optimistic copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(default)]
    pub client_id: Option<String>,
    pub conversation_id: String,
    pub sender_id: String,
    pub body: String,
    #[serde(with = "crate::timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
    /// Local bookkeeping only; never part of the stored or published row.
    #[serde(skip_serializing, default)]
    pub client_state: ClientState,
}

impl Message {
    /// Returns true while the message only exists locally.
    pub fn is_pending(&self) -> bool {
        self.client_state == ClientState::Pending
    }

    /// Sort key for message lists: `created_at` ascending, ties broken by id.
    pub fn sort_key(&self) -> (DateTime<Utc>, &str) {
        (self.created_at, self.id.as_str())
    }
}

/// A two-party conversation row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    #[serde(default)]
    pub participant_ids: Vec<String>,
    #[serde(with = "crate::timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "crate::timestamp")]
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Returns the participant that is not `self_id`, if any.
    pub fn other_participant(&self, self_id: &str) -> Option<&str> {
        self.participant_ids
            .iter()
            .map(String::as_str)
            .find(|p| *p != self_id)
    }

    /// Returns true if `user_id` takes part in the conversation.
    pub fn includes(&self, user_id: &str) -> bool {
        self.participant_ids.iter().any(|p| p == user_id)
    }
}

/// Denormalised last-message preview shown in the conversation list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePreview {
    pub message_id: String,
    pub sender_id: String,
    pub body: String,
    #[serde(with = "crate::timestamp")]
    pub created_at: DateTime<Utc>,
}

impl From<&Message> for MessagePreview {
    fn from(m: &Message) -> Self {
        Self {
            message_id: m.id.clone(),
            sender_id: m.sender_id.clone(),
            body: m.body.clone(),
            created_at: m.created_at,
        }
    }
}

/// One entry of the conversation list.
///
/// `last_message` and `unread_count` are derived from message state and are
/// never taken from a single event payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub participant_ids: Vec<String>,
    pub other_participant_id: Option<String>,
    pub last_message: Option<MessagePreview>,
    pub unread_count: u32,
    #[serde(with = "crate::timestamp")]
    pub updated_at: DateTime<Utc>,
}

/// A shared document.
///
/// `content_version` is the server `updated_at` of the last saved content and
/// acts as the logical clock for last-writer-wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollaborationSession {
    pub id: String,
    #[serde(default)]
    pub document_content: String,
    #[serde(rename = "updated_at", with = "crate::timestamp")]
    pub content_version: DateTime<Utc>,
    #[serde(default)]
    pub updated_by: Option<String>,
    #[serde(default)]
    pub participant_ids: Vec<String>,
}

/// What an annotation marks up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationKind {
    Highlight,
    Comment,
    Drawing,
    StickyNote,
    #[serde(other)]
    Other,
}

/// An annotation on a collaboration session. Never edited in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: String,
    pub session_id: String,
    pub author_id: String,
    pub kind: AnnotationKind,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(with = "crate::timestamp")]
    pub created_at: DateTime<Utc>,
}
