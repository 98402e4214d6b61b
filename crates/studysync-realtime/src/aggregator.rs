//! Conversation list aggregation.
//!
//! Keeps the signed-in user's conversation summaries current. Any change to
//! a conversation row or to one of its messages schedules a recomputation of
//! that conversation's summary; the last message and unread count always
//! come from the store, never from the event payload. Bursts of triggers for
//! the same conversation are coalesced by a [`Debouncer`].

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use studysync_store::{ChangeFeed, RowStore, StoreError};
use studysync_types::{ChangeEvent, Collection, ConversationSummary, Operation, SubscriptionKey};
use tokio::time::{sleep_until, Instant};

use crate::registry::{Delivery, Registry, Subscription};
use crate::{ConnectionState, SyncError, SyncSettings};

/// Coalesces repeated triggers per id within a fixed window.
///
/// The first trigger for an id sets its deadline; further triggers before
/// the deadline are absorbed, so a burst produces one recomputation.
#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    due: HashMap<String, Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            due: HashMap::new(),
        }
    }

    /// Schedules `id`. Returns false if it was already scheduled.
    pub fn schedule(&mut self, id: &str) -> bool {
        if self.due.contains_key(id) {
            return false;
        }
        self.due.insert(id.to_string(), Instant::now() + self.window);
        true
    }

    /// Drops a scheduled id.
    pub fn cancel(&mut self, id: &str) {
        self.due.remove(id);
    }

    pub fn clear(&mut self) {
        self.due.clear();
    }

    /// Earliest deadline, if anything is scheduled.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.due.values().min().copied()
    }

    /// Removes and returns every id due at `now`, sorted.
    pub fn take_due(&mut self, now: Instant) -> Vec<String> {
        let mut ready: Vec<String> = self
            .due
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        ready.sort();
        for id in &ready {
            self.due.remove(id);
        }
        ready
    }

    /// Removes and returns everything scheduled, sorted.
    pub fn take_all(&mut self) -> Vec<String> {
        let mut ids: Vec<String> = self.due.drain().map(|(id, _)| id).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.due.len()
    }

    pub fn is_empty(&self) -> bool {
        self.due.is_empty()
    }
}

/// Result of one step of the conversation list.
#[derive(Debug)]
pub enum ListUpdate {
    /// A recomputation was scheduled for the conversation.
    Scheduled(String),
    /// The conversation was already scheduled; the trigger was absorbed.
    Coalesced(String),
    /// Summaries were recomputed for these conversations.
    Recomputed(Vec<String>),
    /// The conversation left the list.
    Removed(String),
    /// The event did not concern the user's conversations.
    Ignored,
    /// The whole list was reloaded.
    Reloaded,
    /// A reload after lag failed; summaries may be stale.
    ReloadFailed(SyncError),
    /// The subscription dropped. Call [`ConversationList::reconnect`].
    Reconnecting(SyncError),
}

enum Wake {
    Delivery(Delivery),
    Timer,
    Ended,
}

/// The user's conversations, most recently updated first.
pub struct ConversationList<B> {
    backend: Arc<B>,
    registry: Registry<B>,
    key: SubscriptionKey,
    user_id: String,
    summaries: Vec<ConversationSummary>,
    debouncer: Debouncer,
    connection: ConnectionState,
    subscription: Option<Subscription>,
}

impl<B: RowStore + ChangeFeed> ConversationList<B> {
    pub fn new(
        backend: Arc<B>,
        registry: Registry<B>,
        user_id: &str,
        settings: &SyncSettings,
    ) -> Self {
        Self {
            backend,
            registry,
            key: SubscriptionKey::Conversations(user_id.to_string()),
            user_id: user_id.to_string(),
            summaries: Vec::new(),
            debouncer: Debouncer::new(settings.debounce),
            connection: ConnectionState::Connected,
            subscription: None,
        }
    }

    /// Subscribes and loads every conversation of the user.
    pub async fn open(&mut self) -> Result<(), SyncError> {
        if self.subscription.is_some() {
            return Ok(());
        }
        self.subscription = Some(self.registry.acquire(self.key.clone())?);
        if let Err(e) = self.reload().await {
            self.release();
            return Err(e);
        }
        tracing::info!(key = %self.key, conversations = self.summaries.len(), "conversation list live");
        Ok(())
    }

    /// Waits for the next delivery or debounce deadline and processes it.
    ///
    /// Returns `None` once the subscription is gone.
    pub async fn next(&mut self) -> Option<ListUpdate> {
        let deadline = self.debouncer.next_deadline();
        let wake = {
            let subscription = self.subscription.as_mut()?;
            tokio::select! {
                delivery = subscription.events.recv() => delivery.map_or(Wake::Ended, Wake::Delivery),
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => Wake::Timer,
            }
        };

        match wake {
            Wake::Ended => None,
            Wake::Timer => {
                let due = self.debouncer.take_due(Instant::now());
                self.recompute(&due).await;
                Some(ListUpdate::Recomputed(due))
            }
            Wake::Delivery(Delivery::Event(event)) => Some(self.on_event(&event)),
            Wake::Delivery(Delivery::Lagged) => Some(match self.reload().await {
                Ok(()) => ListUpdate::Reloaded,
                Err(e) => {
                    tracing::warn!(key = %self.key, "reload after lag failed: {}", e);
                    ListUpdate::ReloadFailed(e)
                }
            }),
            Wake::Delivery(Delivery::Closed(reason)) => {
                self.connection = ConnectionState::Reconnecting;
                Some(ListUpdate::Reconnecting(SyncError::TransientConnection {
                    key: self.key.clone(),
                    reason,
                }))
            }
        }
    }

    /// Recomputes everything scheduled without waiting for the window.
    pub async fn flush(&mut self) -> Vec<String> {
        let due = self.debouncer.take_all();
        self.recompute(&due).await;
        due
    }

    /// Forced full reload.
    pub async fn resync(&mut self) -> Result<(), SyncError> {
        self.reload().await
    }

    /// Re-acquires the key after a dropped subscription and reloads.
    pub async fn reconnect(&mut self) -> Result<(), SyncError> {
        let fresh = self.registry.acquire(self.key.clone())?;
        if let Some(old) = self.subscription.replace(fresh) {
            self.registry.release(old.token);
        }
        self.connection = ConnectionState::Connected;
        self.reload().await
    }

    fn on_event(&mut self, event: &ChangeEvent) -> ListUpdate {
        let conversation_id = match event.collection {
            Collection::Conversations => {
                let Some(id) = event.row_id() else {
                    return ListUpdate::Ignored;
                };
                if !self.contains(id) && !self.may_involve_user(event) {
                    return ListUpdate::Ignored;
                }
                if event.operation == Operation::Delete {
                    self.debouncer.cancel(id);
                    self.summaries.retain(|s| s.id != id);
                    return ListUpdate::Removed(id.to_string());
                }
                id
            }
            Collection::Messages => match event.str_field("conversation_id") {
                Some(id) if self.contains(id) => id,
                Some(_) => return ListUpdate::Ignored,
                None => {
                    tracing::debug!(key = %self.key, "message event without conversation_id");
                    return ListUpdate::Ignored;
                }
            },
            _ => return ListUpdate::Ignored,
        };

        if self.debouncer.schedule(conversation_id) {
            ListUpdate::Scheduled(conversation_id.to_string())
        } else {
            ListUpdate::Coalesced(conversation_id.to_string())
        }
    }

    /// True unless the row lists its participants and the user is not one.
    fn may_involve_user(&self, event: &ChangeEvent) -> bool {
        match event.row.get("participant_ids").and_then(Value::as_array) {
            Some(participants) => participants
                .iter()
                .any(|p| p.as_str() == Some(self.user_id.as_str())),
            None => true,
        }
    }

    async fn recompute(&mut self, ids: &[String]) {
        for id in ids {
            match self.backend.conversation_summary(id, &self.user_id).await {
                Ok(summary) if summary.participant_ids.contains(&self.user_id) => {
                    self.upsert(summary);
                }
                Ok(_) | Err(StoreError::NotFound(_)) => {
                    self.summaries.retain(|s| &s.id != id);
                }
                Err(e) => {
                    tracing::warn!(
                        conversation_id = %id,
                        "failed to recompute conversation summary, keeping previous: {}",
                        e
                    );
                }
            }
        }
        self.sort();
    }

    async fn reload(&mut self) -> Result<(), SyncError> {
        let conversations = self.backend.list_conversations(&self.user_id).await?;
        let mut summaries = Vec::with_capacity(conversations.len());
        for conversation in conversations {
            summaries.push(
                self.backend
                    .conversation_summary(&conversation.id, &self.user_id)
                    .await?,
            );
        }
        self.summaries = summaries;
        self.debouncer.clear();
        self.sort();
        Ok(())
    }

    fn upsert(&mut self, summary: ConversationSummary) {
        match self.summaries.iter_mut().find(|s| s.id == summary.id) {
            Some(existing) => *existing = summary,
            None => self.summaries.push(summary),
        }
    }

    fn sort(&mut self) {
        self.summaries.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.id.cmp(&b.id))
        });
    }
}

impl<B> ConversationList<B> {
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    /// Summaries sorted by `updated_at` descending.
    pub fn summaries(&self) -> &[ConversationSummary] {
        &self.summaries
    }

    pub fn get(&self, conversation_id: &str) -> Option<&ConversationSummary> {
        self.summaries.iter().find(|s| s.id == conversation_id)
    }

    pub fn total_unread(&self) -> u32 {
        self.summaries.iter().map(|s| s.unread_count).sum()
    }

    /// Conversations waiting for a recomputation.
    pub fn scheduled(&self) -> usize {
        self.debouncer.len()
    }

    fn contains(&self, conversation_id: &str) -> bool {
        self.summaries.iter().any(|s| s.id == conversation_id)
    }

    pub fn close(&mut self) {
        self.release();
        self.debouncer.clear();
    }

    fn release(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            self.registry.release(subscription.token);
        }
    }
}

impl<B> Drop for ConversationList<B> {
    fn drop(&mut self) {
        self.release();
    }
}
