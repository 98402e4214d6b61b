//! Collaborative document sessions.
//!
//! A session is synchronized over two independent keys: document content
//! (`collab-content:{id}`) and annotations (`collab-annotations:{id}`).
//! Content is last-writer-wins on the server `updated_at`; annotations are
//! an append/delete set keyed by id.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use studysync_store::{ChangeFeed, NewAnnotation, RowStore, StoreError};
use studysync_types::{
    Annotation, AnnotationKind, ChangeEvent, CollaborationSession, Collection, Operation,
    SubscriptionKey,
};

use crate::registry::{Delivery, Registry, Subscription};
use crate::{ConnectionState, SyncError};

/// Local state of one shared document.
#[derive(Debug, Clone, PartialEq)]
pub struct CollabDocument {
    session_id: String,
    content: String,
    version: DateTime<Utc>,
    updated_by: Option<String>,
    participant_ids: Vec<String>,
    annotations: Vec<Annotation>,
}

impl CollabDocument {
    pub fn new(session: CollaborationSession, annotations: Vec<Annotation>) -> Self {
        let mut doc = Self {
            session_id: session.id,
            content: session.document_content,
            version: session.content_version,
            updated_by: session.updated_by,
            participant_ids: session.participant_ids,
            annotations: Vec::new(),
        };
        doc.replace_annotations(annotations);
        doc
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Server `updated_at` of the content currently held.
    pub fn version(&self) -> DateTime<Utc> {
        self.version
    }

    pub fn updated_by(&self) -> Option<&str> {
        self.updated_by.as_deref()
    }

    pub fn participant_ids(&self) -> &[String] {
        &self.participant_ids
    }

    /// Annotations in arrival order.
    pub fn annotations(&self) -> &[Annotation] {
        &self.annotations
    }

    /// Applies incoming content if its version is strictly newer.
    pub fn apply_content(&mut self, incoming: CollaborationSession) -> bool {
        if incoming.id != self.session_id || incoming.content_version <= self.version {
            return false;
        }
        self.content = incoming.document_content;
        self.version = incoming.content_version;
        self.updated_by = incoming.updated_by;
        if !incoming.participant_ids.is_empty() {
            self.participant_ids = incoming.participant_ids;
        }
        true
    }

    /// Adds an annotation unless its id is already present.
    pub fn insert_annotation(&mut self, annotation: Annotation) -> bool {
        if annotation.session_id != self.session_id
            || self.annotations.iter().any(|a| a.id == annotation.id)
        {
            return false;
        }
        self.annotations.push(annotation);
        true
    }

    /// Removes an annotation, returning its position and value.
    pub fn remove_annotation(&mut self, id: &str) -> Option<(usize, Annotation)> {
        let idx = self.annotations.iter().position(|a| a.id == id)?;
        Some((idx, self.annotations.remove(idx)))
    }

    /// Puts back an annotation removed by [`CollabDocument::remove_annotation`].
    pub fn restore_annotation(&mut self, idx: usize, annotation: Annotation) {
        if self.annotations.iter().any(|a| a.id == annotation.id) {
            return;
        }
        let idx = idx.min(self.annotations.len());
        self.annotations.insert(idx, annotation);
    }

    /// Replaces the annotation set, dropping duplicate ids.
    pub fn replace_annotations(&mut self, annotations: Vec<Annotation>) {
        self.annotations.clear();
        for annotation in annotations {
            self.insert_annotation(annotation);
        }
    }

    /// Folds in an authoritative reload: content by last-writer-wins, the
    /// annotation set replaced wholesale.
    pub fn merge_snapshot(&mut self, fresh: CollabDocument) {
        let CollabDocument {
            session_id,
            content,
            version,
            updated_by,
            participant_ids,
            annotations,
        } = fresh;
        self.apply_content(CollaborationSession {
            id: session_id,
            document_content: content,
            content_version: version,
            updated_by,
            participant_ids,
        });
        self.replace_annotations(annotations);
    }

    /// Applies a change event for either key. Returns true on change.
    pub fn apply(&mut self, event: &ChangeEvent) -> bool {
        match (event.collection, event.operation) {
            (Collection::CollabSessions, Operation::Update) => {
                match event.decode::<CollaborationSession>() {
                    Ok(session) => self.apply_content(session),
                    Err(e) => {
                        tracing::warn!(session_id = %self.session_id, "dropping undecodable content row: {}", e);
                        false
                    }
                }
            }
            (Collection::Annotations, Operation::Insert) => match event.decode::<Annotation>() {
                Ok(annotation) => self.insert_annotation(annotation),
                Err(e) => {
                    tracing::warn!(session_id = %self.session_id, "dropping undecodable annotation row: {}", e);
                    false
                }
            },
            (Collection::Annotations, Operation::Delete) => match event.row_id() {
                Some(id) => self.remove_annotation(id).is_some(),
                None => false,
            },
            (collection, operation) => {
                tracing::debug!(
                    session_id = %self.session_id,
                    %collection,
                    %operation,
                    "ignoring change not used by collaboration sessions"
                );
                false
            }
        }
    }
}

/// Which of the two session keys a delivery came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollabChannel {
    Content,
    Annotations,
}

/// Result of processing one delivery.
#[derive(Debug)]
pub enum CollabUpdate {
    /// Newer content was applied.
    Content,
    /// The annotation set changed.
    Annotations,
    /// Stale content, duplicate or unknown annotation, or foreign row.
    Ignored(CollabChannel),
    /// A listener lagged and the session was reloaded.
    Resynced,
    /// A listener lagged and the reload failed.
    ResyncFailed(SyncError),
    /// One of the subscriptions dropped. Call [`CollabSession::reconnect`].
    Reconnecting(SyncError),
}

/// A live collaborative document.
pub struct CollabSession<B> {
    backend: Arc<B>,
    registry: Registry<B>,
    user_id: String,
    content_key: SubscriptionKey,
    annotations_key: SubscriptionKey,
    content_sub: Option<Subscription>,
    annotations_sub: Option<Subscription>,
    doc: Option<CollabDocument>,
    connection: ConnectionState,
}

impl<B: RowStore + ChangeFeed> CollabSession<B> {
    pub fn new(backend: Arc<B>, registry: Registry<B>, session_id: &str, user_id: &str) -> Self {
        Self {
            backend,
            registry,
            user_id: user_id.to_string(),
            content_key: SubscriptionKey::CollabContent(session_id.to_string()),
            annotations_key: SubscriptionKey::CollabAnnotations(session_id.to_string()),
            content_sub: None,
            annotations_sub: None,
            doc: None,
            connection: ConnectionState::Connected,
        }
    }

    /// Subscribes to both keys, then loads content and annotations.
    pub async fn open(&mut self) -> Result<(), SyncError> {
        if self.doc.is_some() {
            return Ok(());
        }
        let opened = match self.subscribe() {
            Ok(()) => self.load().await,
            Err(e) => Err(e),
        };

        match opened {
            Ok(doc) => {
                tracing::info!(
                    session_id = %doc.session_id(),
                    annotations = doc.annotations().len(),
                    "collaboration session live"
                );
                self.doc = Some(doc);
                Ok(())
            }
            Err(e) => {
                self.release();
                Err(e)
            }
        }
    }

    /// Waits for the next delivery on either key and applies it.
    ///
    /// Returns `None` when neither subscription can deliver anything more.
    pub async fn next(&mut self) -> Option<CollabUpdate> {
        let (channel, delivery) = {
            let content = self.content_sub.as_mut()?;
            let annotations = self.annotations_sub.as_mut()?;
            tokio::select! {
                Some(delivery) = content.events.recv() => (CollabChannel::Content, delivery),
                Some(delivery) = annotations.events.recv() => (CollabChannel::Annotations, delivery),
                else => return None,
            }
        };

        Some(match delivery {
            Delivery::Event(event) => {
                let changed = self.doc.as_mut().is_some_and(|doc| doc.apply(&event));
                match (changed, channel) {
                    (true, CollabChannel::Content) => CollabUpdate::Content,
                    (true, CollabChannel::Annotations) => CollabUpdate::Annotations,
                    (false, channel) => CollabUpdate::Ignored(channel),
                }
            }
            Delivery::Lagged => match self.resync().await {
                Ok(()) => CollabUpdate::Resynced,
                Err(e) => {
                    tracing::warn!(key = %self.key_for(channel), "resync after lag failed: {}", e);
                    CollabUpdate::ResyncFailed(e)
                }
            },
            Delivery::Closed(reason) => {
                self.connection = ConnectionState::Reconnecting;
                CollabUpdate::Reconnecting(SyncError::TransientConnection {
                    key: self.key_for(channel).clone(),
                    reason,
                })
            }
        })
    }

    /// Saves the whole document.
    ///
    /// The stored row is applied under last-writer-wins, so if a newer save
    /// from another participant has already arrived it stays in place.
    /// Returns the version assigned to this save.
    pub async fn save_content(&mut self, content: String) -> Result<DateTime<Utc>, SyncError> {
        let session_id = self.ensure_live()?.session_id().to_string();
        let saved = self
            .backend
            .save_content(&session_id, &self.user_id, content)
            .await
            .map_err(|e| SyncError::write("save_content", e))?;
        let version = saved.content_version;
        if let Some(doc) = self.doc.as_mut() {
            doc.apply_content(saved);
        }
        Ok(version)
    }

    /// Creates an annotation and adds the stored row.
    pub async fn add_annotation(
        &mut self,
        kind: AnnotationKind,
        payload: serde_json::Value,
    ) -> Result<Annotation, SyncError> {
        let session_id = self.ensure_live()?.session_id().to_string();
        let stored = self
            .backend
            .insert_annotation(NewAnnotation {
                session_id,
                author_id: self.user_id.clone(),
                kind,
                payload,
            })
            .await
            .map_err(|e| SyncError::write("add_annotation", e))?;
        if let Some(doc) = self.doc.as_mut() {
            doc.insert_annotation(stored.clone());
        }
        Ok(stored)
    }

    /// Deletes an annotation, removing it locally first.
    ///
    /// The local copy is restored in its old position if the write fails.
    /// Deleting an annotation the store no longer has is not an error.
    pub async fn delete_annotation(&mut self, annotation_id: &str) -> Result<(), SyncError> {
        self.ensure_live()?;
        let removed = self
            .doc
            .as_mut()
            .and_then(|doc| doc.remove_annotation(annotation_id));

        match self.backend.delete_annotation(annotation_id).await {
            Ok(_) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => {
                if let (Some(doc), Some((idx, annotation))) = (self.doc.as_mut(), removed) {
                    doc.restore_annotation(idx, annotation);
                }
                Err(SyncError::write("delete_annotation", e))
            }
        }
    }

    /// Reloads content (last-writer-wins) and replaces the annotation set.
    pub async fn resync(&mut self) -> Result<(), SyncError> {
        let fresh = self.load().await?;
        match self.doc.as_mut() {
            Some(doc) => doc.merge_snapshot(fresh),
            None => self.doc = Some(fresh),
        }
        Ok(())
    }

    /// Re-acquires both keys after a dropped subscription and resyncs.
    pub async fn reconnect(&mut self) -> Result<(), SyncError> {
        let content = self.registry.acquire(self.content_key.clone())?;
        if let Some(old) = self.content_sub.replace(content) {
            self.registry.release(old.token);
        }
        let annotations = self.registry.acquire(self.annotations_key.clone())?;
        if let Some(old) = self.annotations_sub.replace(annotations) {
            self.registry.release(old.token);
        }
        self.connection = ConnectionState::Connected;
        self.resync().await
    }

    fn subscribe(&mut self) -> Result<(), SyncError> {
        self.content_sub = Some(self.registry.acquire(self.content_key.clone())?);
        self.annotations_sub = Some(self.registry.acquire(self.annotations_key.clone())?);
        Ok(())
    }

    async fn load(&self) -> Result<CollabDocument, SyncError> {
        let session_id = self.content_key.scope_id();
        let session = self.backend.get_collab_session(session_id).await?;
        let annotations = self.backend.list_annotations(session_id).await?;
        Ok(CollabDocument::new(session, annotations))
    }

    fn ensure_live(&self) -> Result<&CollabDocument, SyncError> {
        self.doc
            .as_ref()
            .ok_or_else(|| SyncError::NotLive(self.content_key.clone()))
    }
}

impl<B> CollabSession<B> {
    /// The document, once opened.
    pub fn document(&self) -> Option<&CollabDocument> {
        self.doc.as_ref()
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn keys(&self) -> [&SubscriptionKey; 2] {
        [&self.content_key, &self.annotations_key]
    }

    fn key_for(&self, channel: CollabChannel) -> &SubscriptionKey {
        match channel {
            CollabChannel::Content => &self.content_key,
            CollabChannel::Annotations => &self.annotations_key,
        }
    }

    pub fn close(&mut self) {
        self.release();
        self.doc = None;
    }

    fn release(&mut self) {
        for subscription in [self.content_sub.take(), self.annotations_sub.take()]
            .into_iter()
            .flatten()
        {
            self.registry.release(subscription.token);
        }
    }
}

impl<B> Drop for CollabSession<B> {
    fn drop(&mut self) {
        self.release();
    }
}
