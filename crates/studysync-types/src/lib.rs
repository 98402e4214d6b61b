//! Shared types for the StudySync realtime layer.
//!
//! This crate holds the domain vocabulary every other StudySync crate speaks:
//! the collections the backend exposes, the change operations the feed
//! reports, the logical subscription keys screens ask for, and the row types
//! (messages, conversations, collaboration sessions, annotations) the
//! processors merge.
//!
//! Nothing here performs I/O. The store crate persists these types, the
//! realtime crate merges them, and the server binary renders them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

mod event;
mod model;
pub mod timestamp;

pub use event::ChangeEvent;
pub use model::{
    Annotation, AnnotationKind, ClientState, CollaborationSession, Conversation,
    ConversationSummary, Message, MessagePreview,
};

/// Errors produced when parsing wire strings into domain types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The collection name is not one the backend exposes.
    #[error("unknown collection: {0}")]
    UnknownCollection(String),
    /// The operation name is not INSERT, UPDATE or DELETE.
    #[error("unknown operation: {0}")]
    UnknownOperation(String),
    /// The subscription key does not have the `kind:id` shape.
    #[error("malformed subscription key: {0}")]
    MalformedKey(String),
}

/// A named collection (table) in the managed backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    /// Two-party conversations.
    Conversations,
    /// Chat messages, each belonging to one conversation.
    Messages,
    /// Shared documents edited by several participants.
    CollabSessions,
    /// Annotations attached to a collaboration session.
    Annotations,
}

impl Collection {
    /// Returns the table name used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Conversations => "conversations",
            Self::Messages => "messages",
            Self::CollabSessions => "collab_sessions",
            Self::Annotations => "annotations",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conversations" => Ok(Self::Conversations),
            "messages" => Ok(Self::Messages),
            "collab_sessions" => Ok(Self::CollabSessions),
            "annotations" => Ok(Self::Annotations),
            other => Err(ParseError::UnknownCollection(other.to_string())),
        }
    }
}

/// The kind of row change reported by the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    /// A row was created.
    Insert,
    /// A row was modified.
    Update,
    /// A row was removed.
    Delete,
}

impl Operation {
    /// All three operations, for subscriptions that want every change.
    pub const ALL: [Operation; 3] = [Self::Insert, Self::Update, Self::Delete];

    /// Returns the upper-case label used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(Self::Insert),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            _ => Err(ParseError::UnknownOperation(s.to_string())),
        }
    }
}

/// Identifies one logical feed a screen listens to.
///
/// The registry keeps at most one live subscription per key. The string form
/// (`messages:{conversationId}`, `conversations:{userId}`,
/// `collab-content:{sessionId}`, `collab-annotations:{sessionId}`) is what
/// shows up in logs and the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum SubscriptionKey {
    /// Messages of a single conversation.
    Messages(String),
    /// Conversation list of a user (conversation and message changes).
    Conversations(String),
    /// Document content of a collaboration session.
    CollabContent(String),
    /// Annotation set of a collaboration session.
    CollabAnnotations(String),
}

impl SubscriptionKey {
    fn prefix(&self) -> &'static str {
        match self {
            Self::Messages(_) => "messages",
            Self::Conversations(_) => "conversations",
            Self::CollabContent(_) => "collab-content",
            Self::CollabAnnotations(_) => "collab-annotations",
        }
    }

    /// Returns the id the key is scoped to.
    pub fn scope_id(&self) -> &str {
        match self {
            Self::Messages(id)
            | Self::Conversations(id)
            | Self::CollabContent(id)
            | Self::CollabAnnotations(id) => id,
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.prefix(), self.scope_id())
    }
}

impl FromStr for SubscriptionKey {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, id) = s
            .split_once(':')
            .ok_or_else(|| ParseError::MalformedKey(s.to_string()))?;
        if id.is_empty() {
            return Err(ParseError::MalformedKey(s.to_string()));
        }
        let id = id.to_string();
        match prefix {
            "messages" => Ok(Self::Messages(id)),
            "conversations" => Ok(Self::Conversations(id)),
            "collab-content" => Ok(Self::CollabContent(id)),
            "collab-annotations" => Ok(Self::CollabAnnotations(id)),
            _ => Err(ParseError::MalformedKey(s.to_string())),
        }
    }
}

impl From<SubscriptionKey> for String {
    fn from(key: SubscriptionKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for SubscriptionKey {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
