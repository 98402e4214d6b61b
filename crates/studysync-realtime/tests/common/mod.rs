#![allow(dead_code)]

use serde_json::json;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use studysync_db::{create_pool, run_migrations, DbRuntimeSettings};
use studysync_realtime::{SyncClient, SyncSettings};
use studysync_store::{
    ChangeFeed, FeedBinding, FeedError, FeedHub, FeedStream, NewAnnotation, NewMessage, RowStore,
    SqliteBackend, StaticIdentity, StoreError,
};
use studysync_types::{Annotation, CollaborationSession, Conversation, ConversationSummary, Message};
use tempfile::TempDir;

/// SQLite backend whose writes can be switched off to simulate being offline.
pub struct FlakyBackend {
    inner: SqliteBackend,
    offline: AtomicBool,
}

impl FlakyBackend {
    pub fn sqlite(&self) -> &SqliteBackend {
        &self.inner
    }

    pub fn hub(&self) -> &FeedHub {
        self.inner.hub()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("offline".to_string()))
        } else {
            Ok(())
        }
    }
}

impl ChangeFeed for FlakyBackend {
    fn subscribe(&self, bindings: Vec<FeedBinding>) -> Result<FeedStream, FeedError> {
        self.inner.subscribe(bindings)
    }
}

impl RowStore for FlakyBackend {
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        self.inner.list_messages(conversation_id).await
    }

    async fn insert_message(&self, draft: NewMessage) -> Result<Message, StoreError> {
        self.check_online()?;
        self.inner.insert_message(draft).await
    }

    async fn mark_read(
        &self,
        conversation_id: &str,
        reader_id: &str,
        message_ids: Vec<String>,
    ) -> Result<Vec<Message>, StoreError> {
        self.check_online()?;
        self.inner
            .mark_read(conversation_id, reader_id, message_ids)
            .await
    }

    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>, StoreError> {
        self.inner.list_conversations(user_id).await
    }

    async fn conversation_summary(
        &self,
        conversation_id: &str,
        viewer_id: &str,
    ) -> Result<ConversationSummary, StoreError> {
        self.inner
            .conversation_summary(conversation_id, viewer_id)
            .await
    }

    async fn get_collab_session(
        &self,
        session_id: &str,
    ) -> Result<CollaborationSession, StoreError> {
        self.inner.get_collab_session(session_id).await
    }

    async fn save_content(
        &self,
        session_id: &str,
        author_id: &str,
        content: String,
    ) -> Result<CollaborationSession, StoreError> {
        self.check_online()?;
        self.inner.save_content(session_id, author_id, content).await
    }

    async fn list_annotations(&self, session_id: &str) -> Result<Vec<Annotation>, StoreError> {
        self.inner.list_annotations(session_id).await
    }

    async fn insert_annotation(&self, draft: NewAnnotation) -> Result<Annotation, StoreError> {
        self.check_online()?;
        self.inner.insert_annotation(draft).await
    }

    async fn delete_annotation(&self, annotation_id: &str) -> Result<Annotation, StoreError> {
        self.check_online()?;
        self.inner.delete_annotation(annotation_id).await
    }
}

pub fn setup_backend() -> (TempDir, Arc<FlakyBackend>) {
    let dir = tempfile::tempdir().expect("failed to create tempdir");
    let path = dir.path().join("sync.db");
    let pool = create_pool(
        path.to_str().expect("utf-8 path"),
        DbRuntimeSettings::default(),
    )
    .expect("failed to create pool");
    {
        let conn = pool.get().expect("failed to get connection");
        run_migrations(&conn).expect("failed to run migrations");
    }
    let backend = FlakyBackend {
        inner: SqliteBackend::new(pool, FeedHub::default()),
        offline: AtomicBool::new(false),
    };
    (dir, Arc::new(backend))
}

pub fn client_for(
    backend: &Arc<FlakyBackend>,
    user_id: &str,
    settings: SyncSettings,
) -> SyncClient<FlakyBackend, StaticIdentity> {
    SyncClient::new(
        Arc::clone(backend),
        Arc::new(StaticIdentity::signed_in(user_id)),
        settings,
    )
}

/// Writes a message as `sender` directly through the store.
pub async fn post(
    backend: &FlakyBackend,
    conversation_id: &str,
    sender: &str,
    body: &str,
) -> Message {
    backend
        .sqlite()
        .insert_message(NewMessage {
            client_id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: sender.to_string(),
            body: body.to_string(),
        })
        .await
        .expect("failed to post message")
}

/// Raw insert notification for a stored message, as the feed would send it.
pub fn insert_payload(message: &Message) -> serde_json::Value {
    json!({
        "schema": "public",
        "table": "messages",
        "eventType": "INSERT",
        "new": serde_json::to_value(message).expect("message encodes"),
        "old": {},
        "commit_timestamp": null,
        "errors": null
    })
}

/// Awaits `fut`, failing the test if it takes longer than five seconds.
pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out waiting for the view")
}
