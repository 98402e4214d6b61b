//! Async backend seams and the SQLite reference implementation.
//!
//! The realtime layer is generic over [`RowStore`] (bulk reads and writes)
//! and [`ChangeFeed`] (row-change subscriptions). [`SqliteBackend`] provides
//! both on top of a pooled SQLite database: queries run on the blocking pool,
//! and every committed write publishes one feed notification per row it
//! touched, the way postgres_changes does.

use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, RwLock};
use studysync_db::DbPool;
use studysync_types::{
    Annotation, AnnotationKind, CollaborationSession, Collection, Conversation,
    ConversationSummary, Message, Operation,
};

use crate::collab::{self, CreateAnnotationParams, CreateSessionParams};
use crate::conversations::{self, CreateConversationParams};
use crate::error::{FeedError, StoreError};
use crate::feed::{ChangeFeed, FeedBinding, FeedHub, FeedStream};
use crate::messages::{self, CreateMessageParams};

/// A message write issued by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    /// Idempotency id; the stored row carries it back on the feed.
    pub client_id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub body: String,
}

/// An annotation write issued by the client.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAnnotation {
    pub session_id: String,
    pub author_id: String,
    pub kind: AnnotationKind,
    pub payload: serde_json::Value,
}

/// Bulk reads and writes on the synchronised collections.
pub trait RowStore: Send + Sync + 'static {
    /// Every message of a conversation, ordered by `created_at` then id.
    fn list_messages(
        &self,
        conversation_id: &str,
    ) -> impl Future<Output = Result<Vec<Message>, StoreError>> + Send;

    /// Stores a message. Retrying with the same client id is safe.
    fn insert_message(
        &self,
        draft: NewMessage,
    ) -> impl Future<Output = Result<Message, StoreError>> + Send;

    /// Marks the listed messages read for `reader_id`; returns changed rows.
    fn mark_read(
        &self,
        conversation_id: &str,
        reader_id: &str,
        message_ids: Vec<String>,
    ) -> impl Future<Output = Result<Vec<Message>, StoreError>> + Send;

    /// Conversations the user takes part in.
    fn list_conversations(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<Vec<Conversation>, StoreError>> + Send;

    /// Authoritative list entry for one conversation.
    fn conversation_summary(
        &self,
        conversation_id: &str,
        viewer_id: &str,
    ) -> impl Future<Output = Result<ConversationSummary, StoreError>> + Send;

    /// A collaboration session with its current content.
    fn get_collab_session(
        &self,
        session_id: &str,
    ) -> impl Future<Output = Result<CollaborationSession, StoreError>> + Send;

    /// Overwrites document content; the returned row carries the new version.
    fn save_content(
        &self,
        session_id: &str,
        author_id: &str,
        content: String,
    ) -> impl Future<Output = Result<CollaborationSession, StoreError>> + Send;

    /// Annotations of a session in creation order.
    fn list_annotations(
        &self,
        session_id: &str,
    ) -> impl Future<Output = Result<Vec<Annotation>, StoreError>> + Send;

    /// Stores an annotation.
    fn insert_annotation(
        &self,
        draft: NewAnnotation,
    ) -> impl Future<Output = Result<Annotation, StoreError>> + Send;

    /// Removes an annotation.
    fn delete_annotation(
        &self,
        annotation_id: &str,
    ) -> impl Future<Output = Result<Annotation, StoreError>> + Send;
}

/// Yields the signed-in user, or `None` for guests.
pub trait IdentityProvider: Send + Sync + 'static {
    fn current_user(&self) -> Option<String>;
}

/// Identity provider backed by a settable value.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    user_id: Arc<RwLock<Option<String>>>,
}

impl StaticIdentity {
    /// Signed in as `user_id`.
    pub fn signed_in(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Arc::new(RwLock::new(Some(user_id.into()))),
        }
    }

    /// No user.
    pub fn guest() -> Self {
        Self::default()
    }

    /// Switches the current user (`None` signs out).
    pub fn set(&self, user_id: Option<String>) {
        let mut guard = self
            .user_id
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = user_id;
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_user(&self) -> Option<String> {
        self.user_id
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// SQLite-backed [`RowStore`] and [`ChangeFeed`].
#[derive(Clone)]
pub struct SqliteBackend {
    pool: DbPool,
    hub: FeedHub,
}

impl SqliteBackend {
    pub fn new(pool: DbPool, hub: FeedHub) -> Self {
        Self { pool, hub }
    }

    /// The feed this backend publishes to.
    pub fn hub(&self) -> &FeedHub {
        &self.hub
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Runs `f` on a pooled connection on the blocking thread pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    fn publish<T: Serialize>(
        &self,
        collection: Collection,
        operation: Operation,
        new: Option<&T>,
        old: Option<&T>,
    ) {
        let encode = |row: Option<&T>| match row.map(serde_json::to_value).transpose() {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(%collection, "failed to encode feed row: {}", e);
                None
            }
        };
        self.hub
            .publish(collection, operation, encode(new), encode(old));
    }

    /// Creates a two-party conversation and publishes its insert.
    pub async fn create_conversation(
        &self,
        id: impl Into<String>,
        participant_ids: [&str; 2],
    ) -> Result<Conversation, StoreError> {
        let params = CreateConversationParams {
            id: id.into(),
            participant_ids: participant_ids.iter().map(|p| p.to_string()).collect(),
        };
        let conversation = self
            .with_conn(move |conn| conversations::create_conversation(conn, &params))
            .await?;
        self.publish(
            Collection::Conversations,
            Operation::Insert,
            Some(&conversation),
            None,
        );
        Ok(conversation)
    }

    /// Creates a collaboration session and publishes its insert.
    pub async fn create_session(
        &self,
        params: CreateSessionParams,
    ) -> Result<CollaborationSession, StoreError> {
        let session = self
            .with_conn(move |conn| collab::create_session(conn, &params))
            .await?;
        self.publish(
            Collection::CollabSessions,
            Operation::Insert,
            Some(&session),
            None,
        );
        Ok(session)
    }

    /// Deletes a message and publishes the delete.
    pub async fn delete_message(&self, message_id: &str) -> Result<Message, StoreError> {
        let id = message_id.to_string();
        let removed = self
            .with_conn(move |conn| messages::delete_message(conn, &id))
            .await?;
        self.publish::<Message>(Collection::Messages, Operation::Delete, None, Some(&removed));
        Ok(removed)
    }
}

impl ChangeFeed for SqliteBackend {
    fn subscribe(&self, bindings: Vec<FeedBinding>) -> Result<FeedStream, FeedError> {
        self.hub.subscribe(bindings)
    }
}

impl RowStore for SqliteBackend {
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        let id = conversation_id.to_string();
        self.with_conn(move |conn| messages::list_messages(conn, &id))
            .await
    }

    async fn insert_message(&self, draft: NewMessage) -> Result<Message, StoreError> {
        let params = CreateMessageParams {
            client_id: Some(draft.client_id),
            conversation_id: draft.conversation_id,
            sender_id: draft.sender_id,
            body: draft.body,
        };
        let (created, conversation) = self
            .with_conn(move |conn| {
                // Write-locked up front so concurrent sends queue on the busy
                // timeout instead of failing to upgrade a read snapshot.
                let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
                let created = messages::create_message(&tx, &params)?;
                let conversation = if created.inserted {
                    Some(conversations::touch_conversation(
                        &tx,
                        &params.conversation_id,
                        created.message.created_at,
                    )?)
                } else {
                    None
                };
                tx.commit()?;
                Ok((created, conversation))
            })
            .await?;

        if created.inserted {
            self.publish(
                Collection::Messages,
                Operation::Insert,
                Some(&created.message),
                None,
            );
        }
        if let Some(conversation) = conversation {
            self.publish(
                Collection::Conversations,
                Operation::Update,
                Some(&conversation),
                None,
            );
        }
        Ok(created.message)
    }

    async fn mark_read(
        &self,
        conversation_id: &str,
        reader_id: &str,
        message_ids: Vec<String>,
    ) -> Result<Vec<Message>, StoreError> {
        let conversation_id = conversation_id.to_string();
        let reader_id = reader_id.to_string();
        let updated = self
            .with_conn(move |conn| {
                messages::mark_read(conn, &conversation_id, &reader_id, &message_ids)
            })
            .await?;
        for message in &updated {
            self.publish(Collection::Messages, Operation::Update, Some(message), None);
        }
        Ok(updated)
    }

    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>, StoreError> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| conversations::list_conversations_for_user(conn, &user_id))
            .await
    }

    async fn conversation_summary(
        &self,
        conversation_id: &str,
        viewer_id: &str,
    ) -> Result<ConversationSummary, StoreError> {
        let conversation_id = conversation_id.to_string();
        let viewer_id = viewer_id.to_string();
        self.with_conn(move |conn| {
            conversations::conversation_summary(conn, &conversation_id, &viewer_id)
        })
        .await
    }

    async fn get_collab_session(
        &self,
        session_id: &str,
    ) -> Result<CollaborationSession, StoreError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| collab::get_session(conn, &session_id))
            .await
    }

    async fn save_content(
        &self,
        session_id: &str,
        author_id: &str,
        content: String,
    ) -> Result<CollaborationSession, StoreError> {
        let session_id = session_id.to_string();
        let author_id = author_id.to_string();
        let saved = self
            .with_conn(move |conn| collab::save_content(conn, &session_id, &author_id, &content))
            .await?;
        self.publish(
            Collection::CollabSessions,
            Operation::Update,
            Some(&saved),
            None,
        );
        Ok(saved)
    }

    async fn list_annotations(&self, session_id: &str) -> Result<Vec<Annotation>, StoreError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| collab::list_annotations(conn, &session_id))
            .await
    }

    async fn insert_annotation(&self, draft: NewAnnotation) -> Result<Annotation, StoreError> {
        let params = CreateAnnotationParams {
            session_id: draft.session_id,
            author_id: draft.author_id,
            kind: draft.kind,
            payload: draft.payload,
        };
        let annotation = self
            .with_conn(move |conn| collab::create_annotation(conn, &params))
            .await?;
        self.publish(
            Collection::Annotations,
            Operation::Insert,
            Some(&annotation),
            None,
        );
        Ok(annotation)
    }

    async fn delete_annotation(&self, annotation_id: &str) -> Result<Annotation, StoreError> {
        let id = annotation_id.to_string();
        let removed = self
            .with_conn(move |conn| collab::delete_annotation(conn, &id))
            .await?;
        self.publish::<Annotation>(
            Collection::Annotations,
            Operation::Delete,
            None,
            Some(&removed),
        );
        Ok(removed)
    }
}
