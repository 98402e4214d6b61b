//! Message stream processor for one conversation.
//!
//! Lifecycle is `Uninitialized -> Loading -> Live`. Opening acquires the
//! `messages:{conversation}` key first and only then issues the bulk read,
//! so every change committed after the snapshot is already queued on the
//! subscription. Queued events are replayed over the snapshot once the view
//! is live; the merge rules in [`MessageList`] make the replay idempotent.

use std::sync::Arc;
use studysync_store::{ChangeFeed, NewMessage, RowStore};
use studysync_types::{Message, SubscriptionKey};

use crate::message_list::{Merge, MessageList};
use crate::read_state::ReadTracker;
use crate::registry::{Delivery, Registry, Subscription};
use crate::{ConnectionState, SyncError, SyncSettings};

/// Where the processor is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Uninitialized,
    Loading,
    Live,
}

/// Result of processing one delivery.
#[derive(Debug)]
pub enum StreamUpdate {
    /// An event was merged (possibly as a no-op).
    Merged(Merge),
    /// The listener lagged and the list was reloaded.
    Resynced,
    /// The listener lagged and the reload failed; the list may be stale.
    ResyncFailed(SyncError),
    /// The subscription dropped. Call [`MessageStream::reconnect`].
    Reconnecting(SyncError),
}

/// A message written optimistically but not yet sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    pub local_id: String,
    pub client_id: String,
    pub body: String,
}

/// Live, merged message list of one conversation.
pub struct MessageStream<B> {
    backend: Arc<B>,
    registry: Registry<B>,
    key: SubscriptionKey,
    self_id: String,
    list: MessageList,
    reads: ReadTracker,
    state: StreamState,
    connection: ConnectionState,
    subscription: Option<Subscription>,
}

impl<B: RowStore + ChangeFeed> MessageStream<B> {
    /// Creates an unopened stream. Call [`MessageStream::open`] before use.
    pub fn new(
        backend: Arc<B>,
        registry: Registry<B>,
        conversation_id: &str,
        self_id: &str,
        settings: &SyncSettings,
    ) -> Self {
        Self {
            backend,
            registry,
            key: SubscriptionKey::Messages(conversation_id.to_string()),
            self_id: self_id.to_string(),
            list: MessageList::new(conversation_id, settings.pending_match_window),
            reads: ReadTracker::new(self_id),
            state: StreamState::Uninitialized,
            connection: ConnectionState::Connected,
            subscription: None,
        }
    }

    /// Subscribes, loads the existing messages and goes live.
    ///
    /// Calling it on a live stream does nothing. On failure the stream is
    /// left uninitialized and holds no subscription.
    pub async fn open(&mut self) -> Result<(), SyncError> {
        if self.state != StreamState::Uninitialized {
            return Ok(());
        }
        self.state = StreamState::Loading;

        match self.registry.acquire(self.key.clone()) {
            Ok(subscription) => self.subscription = Some(subscription),
            Err(e) => {
                self.state = StreamState::Uninitialized;
                return Err(e);
            }
        }

        match self.backend.list_messages(self.list.conversation_id()).await {
            Ok(rows) => {
                self.list.replace_with(rows);
                self.state = StreamState::Live;
                tracing::info!(key = %self.key, messages = self.list.len(), "message stream live");
                Ok(())
            }
            Err(e) => {
                self.release();
                self.state = StreamState::Uninitialized;
                Err(e.into())
            }
        }
    }

    /// Waits for the next delivery and applies it.
    ///
    /// Returns `None` when the stream holds no subscription or its listener
    /// has been replaced or released.
    pub async fn next(&mut self) -> Option<StreamUpdate> {
        let delivery = self.subscription.as_mut()?.events.recv().await?;
        Some(self.handle(delivery).await)
    }

    async fn handle(&mut self, delivery: Delivery) -> StreamUpdate {
        match delivery {
            Delivery::Event(event) => StreamUpdate::Merged(self.list.apply(&event)),
            Delivery::Lagged => match self.resync().await {
                Ok(()) => StreamUpdate::Resynced,
                Err(e) => {
                    tracing::warn!(key = %self.key, "resync after lag failed: {}", e);
                    StreamUpdate::ResyncFailed(e)
                }
            },
            Delivery::Closed(reason) => {
                self.connection = ConnectionState::Reconnecting;
                StreamUpdate::Reconnecting(SyncError::TransientConnection {
                    key: self.key.clone(),
                    reason,
                })
            }
        }
    }

    /// Adds an optimistic entry for `body` and returns what to commit.
    pub fn stage(&mut self, body: &str) -> Result<PendingSend, SyncError> {
        self.ensure_live()?;
        let pending = self.list.stage(&self.self_id, body);
        Ok(PendingSend {
            local_id: pending.id,
            client_id: pending.client_id.unwrap_or_default(),
            body: pending.body,
        })
    }

    /// Writes a staged message.
    ///
    /// On failure the optimistic entry is removed. On success the list is
    /// left alone: the confirmed row arrives as an insert event and replaces
    /// the pending entry then. Returns the stored row.
    pub async fn commit(&mut self, pending: PendingSend) -> Result<Message, SyncError> {
        let draft = NewMessage {
            client_id: pending.client_id,
            conversation_id: self.list.conversation_id().to_string(),
            sender_id: self.self_id.clone(),
            body: pending.body,
        };
        match self.backend.insert_message(draft).await {
            Ok(stored) => Ok(stored),
            Err(e) => {
                self.list.discard_pending(&pending.local_id);
                tracing::warn!(key = %self.key, local_id = %pending.local_id, "send failed: {}", e);
                Err(SyncError::write("send_message", e))
            }
        }
    }

    /// Stages and commits in one step.
    pub async fn send(&mut self, body: &str) -> Result<Message, SyncError> {
        let pending = self.stage(body)?;
        self.commit(pending).await
    }

    /// Marks every observed unread message from the other participant read.
    pub async fn mark_read(&mut self) -> Result<usize, SyncError> {
        self.ensure_live()?;
        self.reads.mark_read(self.backend.as_ref(), &mut self.list).await
    }

    /// Reloads the list from the store, keeping unconfirmed local entries.
    pub async fn resync(&mut self) -> Result<(), SyncError> {
        let rows = self
            .backend
            .list_messages(self.list.conversation_id())
            .await?;
        self.list.replace_with(rows);
        tracing::debug!(key = %self.key, messages = self.list.len(), "message stream resynced");
        Ok(())
    }

    /// Re-acquires the key after a dropped subscription and resyncs.
    pub async fn reconnect(&mut self) -> Result<(), SyncError> {
        let fresh = self.registry.acquire(self.key.clone())?;
        if let Some(old) = self.subscription.replace(fresh) {
            self.registry.release(old.token);
        }
        self.connection = ConnectionState::Connected;
        self.resync().await
    }

    fn ensure_live(&self) -> Result<(), SyncError> {
        if self.state == StreamState::Live {
            Ok(())
        } else {
            Err(SyncError::NotLive(self.key.clone()))
        }
    }
}

impl<B> MessageStream<B> {
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    /// The merged list, sorted by `(created_at, id)`.
    pub fn messages(&self) -> &[Message] {
        self.list.messages()
    }

    /// Unread messages from the other participant.
    pub fn unread_count(&self) -> u32 {
        self.list.unread_count(&self.self_id)
    }

    /// Releases the subscription. Further calls to `next` return `None`.
    pub fn close(&mut self) {
        self.release();
        self.state = StreamState::Uninitialized;
    }

    fn release(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            self.registry.release(subscription.token);
        }
    }
}

impl<B> Drop for MessageStream<B> {
    fn drop(&mut self) {
        self.release();
    }
}
