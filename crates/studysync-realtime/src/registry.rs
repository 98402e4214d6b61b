//! Channel registry.
//!
//! Owns the mapping from a [`SubscriptionKey`] to the one live feed
//! subscription serving it. Each key has a single [`ChannelHandle`] holding
//! the feed subscription, a reader task that normalizes notifications, and
//! the current listener. Acquiring a key that already has a handle replaces
//! the listener instead of opening a second subscription; the feed is torn
//! down when the last outstanding token for the key is released.
//!
//! Listeners receive deliveries through an [`EventStream`]. Once a listener
//! is replaced or released its stream yields `None` immediately, discarding
//! anything still queued.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use studysync_store::{ChangeFeed, FeedBinding, FeedGuard, FeedItem, FeedReceiver, RowFilter};
use studysync_types::{ChangeEvent, Collection, Operation, SubscriptionKey};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::normalizer::normalize;
use crate::SyncError;

/// Feed bindings that serve a subscription key.
pub fn bindings_for(key: &SubscriptionKey) -> Vec<FeedBinding> {
    match key {
        SubscriptionKey::Messages(conversation_id) => vec![FeedBinding::all(Collection::Messages)
            .filtered(RowFilter::eq("conversation_id", conversation_id))],
        // Message rows do not name their participants, so the list listens
        // to every message and filters by the conversations it knows.
        SubscriptionKey::Conversations(_) => vec![
            FeedBinding::all(Collection::Conversations),
            FeedBinding::all(Collection::Messages),
        ],
        SubscriptionKey::CollabContent(session_id) => {
            vec![FeedBinding::all(Collection::CollabSessions)
                .filtered(RowFilter::eq("id", session_id))
                .only(&[Operation::Update])]
        }
        SubscriptionKey::CollabAnnotations(session_id) => {
            vec![FeedBinding::all(Collection::Annotations)
                .filtered(RowFilter::eq("session_id", session_id))
                .only(&[Operation::Insert, Operation::Delete])]
        }
    }
}

/// Something delivered to a listener.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// A normalized row change.
    Event(ChangeEvent),
    /// Deliveries were dropped because the listener fell behind. The view
    /// should resync.
    Lagged,
    /// The feed subscription ended. Nothing more will arrive until the key
    /// is acquired again.
    Closed(String),
}

/// Identifies one `acquire` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionToken(u64);

/// The result of [`Registry::acquire`].
#[derive(Debug)]
pub struct Subscription {
    pub token: SubscriptionToken,
    pub key: SubscriptionKey,
    pub events: EventStream,
}

#[derive(Debug, Default)]
struct ListenerShared {
    active: AtomicBool,
    lagged: AtomicBool,
    closed: Mutex<Option<String>>,
}

/// Receiving side of a listener.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<Delivery>,
    shared: Arc<ListenerShared>,
}

impl EventStream {
    /// Waits for the next delivery.
    ///
    /// Returns `None` once the listener has been replaced or released, even
    /// if deliveries are still buffered.
    pub async fn recv(&mut self) -> Option<Delivery> {
        if !self.is_active() {
            return None;
        }
        if self.shared.lagged.swap(false, Ordering::AcqRel) {
            return Some(Delivery::Lagged);
        }
        match self.rx.recv().await {
            Some(delivery) if self.is_active() => Some(delivery),
            Some(_) => None,
            None if self.is_active() => lock(&self.shared.closed).take().map(Delivery::Closed),
            None => None,
        }
    }

    /// False once the listener has been replaced or released.
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }
}

struct Listener {
    token: u64,
    tx: Option<mpsc::Sender<Delivery>>,
    shared: Arc<ListenerShared>,
}

impl Listener {
    fn deactivate(self) {
        self.shared.active.store(false, Ordering::Release);
        // Dropping `tx` wakes a pending `recv`.
    }
}

#[derive(Default)]
struct Slot {
    listener: Option<Listener>,
    dead: bool,
}

/// One live subscription for one key.
struct ChannelHandle {
    slot: Arc<Mutex<Slot>>,
    guard: FeedGuard,
    reader: JoinHandle<()>,
    tokens: HashSet<u64>,
}

impl ChannelHandle {
    fn is_dead(&self) -> bool {
        lock(&self.slot).dead
    }

    fn replace_listener(&self, listener: Listener) -> Option<u64> {
        let previous = lock(&self.slot).listener.replace(listener);
        previous.map(|old| {
            let token = old.token;
            old.deactivate();
            token
        })
    }

    fn teardown(mut self) {
        if let Some(listener) = lock(&self.slot).listener.take() {
            listener.deactivate();
        }
        self.guard.cancel();
        self.reader.abort();
    }
}

struct RegistryState {
    next_token: u64,
    handles: HashMap<SubscriptionKey, ChannelHandle>,
    tokens: HashMap<u64, SubscriptionKey>,
}

/// Point-in-time view of one handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandleStatus {
    pub key: SubscriptionKey,
    /// Token of the current listener, if any.
    pub listener: Option<SubscriptionToken>,
    /// Outstanding tokens; the handle closes when this reaches zero.
    pub tokens: usize,
    /// The feed subscription ended and has not been reopened.
    pub dead: bool,
}

/// Session-scoped registry of live subscriptions.
///
/// Cheap to clone; clones share the same handles.
pub struct Registry<F> {
    feed: Arc<F>,
    capacity: usize,
    state: Arc<Mutex<RegistryState>>,
}

impl<F> Clone for Registry<F> {
    fn clone(&self) -> Self {
        Self {
            feed: Arc::clone(&self.feed),
            capacity: self.capacity,
            state: Arc::clone(&self.state),
        }
    }
}

impl<F: ChangeFeed> Registry<F> {
    /// Creates an empty registry whose listeners buffer `capacity` deliveries.
    pub fn new(feed: Arc<F>, capacity: usize) -> Self {
        Self {
            feed,
            capacity: capacity.max(1),
            state: Arc::new(Mutex::new(RegistryState {
                next_token: 1,
                handles: HashMap::new(),
                tokens: HashMap::new(),
            })),
        }
    }

    /// Subscribes to `key`.
    ///
    /// Opens the feed subscription if the key has no handle, or if its
    /// handle is dead. Otherwise the existing handle is kept and its listener
    /// is replaced: the previous [`EventStream`] ends immediately, and its
    /// token stays outstanding until released.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn acquire(&self, key: SubscriptionKey) -> Result<Subscription, SyncError> {
        let mut state = self.lock();
        let token = state.next_token;
        state.next_token += 1;

        let (tx, rx) = mpsc::channel(self.capacity);
        let shared = Arc::new(ListenerShared {
            active: AtomicBool::new(true),
            ..Default::default()
        });
        let listener = Listener {
            token,
            tx: Some(tx),
            shared: Arc::clone(&shared),
        };

        let reopen = state.handles.get(&key).map_or(true, ChannelHandle::is_dead);
        if reopen {
            let (feed_rx, guard) = self.feed.subscribe(bindings_for(&key))?.into_parts();
            let slot = Arc::new(Mutex::new(Slot {
                listener: Some(listener),
                dead: false,
            }));
            let reader = tokio::spawn(read_feed(key.clone(), feed_rx, Arc::clone(&slot)));
            let fresh = ChannelHandle {
                slot,
                guard,
                reader,
                tokens: HashSet::new(),
            };

            match state.handles.get_mut(&key) {
                Some(handle) => {
                    let old = std::mem::replace(handle, fresh);
                    handle.tokens = old.tokens.clone();
                    old.teardown();
                    tracing::info!(key = %key, token, "reopened dead subscription");
                }
                None => {
                    state.handles.insert(key.clone(), fresh);
                    tracing::info!(key = %key, token, "opened subscription");
                }
            }
        } else if let Some(handle) = state.handles.get(&key) {
            let replaced = handle.replace_listener(listener);
            tracing::debug!(key = %key, token, replaced = ?replaced, "replaced listener");
        }

        if let Some(handle) = state.handles.get_mut(&key) {
            handle.tokens.insert(token);
        }
        state.tokens.insert(token, key.clone());

        Ok(Subscription {
            token: SubscriptionToken(token),
            key,
            events: EventStream { rx, shared },
        })
    }
}

impl<F> Registry<F> {
    /// Releases a token.
    ///
    /// Stops delivery to the token's listener if it is still the current
    /// one, and tears the subscription down if this was the key's last
    /// outstanding token. Returns false for unknown or already released
    /// tokens.
    pub fn release(&self, token: SubscriptionToken) -> bool {
        let mut state = self.lock();
        let Some(key) = state.tokens.remove(&token.0) else {
            tracing::debug!(token = token.0, "release of unknown token ignored");
            return false;
        };

        let last = match state.handles.get_mut(&key) {
            Some(handle) => {
                handle.tokens.remove(&token.0);
                let mut slot = lock(&handle.slot);
                if slot.listener.as_ref().is_some_and(|l| l.token == token.0) {
                    if let Some(listener) = slot.listener.take() {
                        listener.deactivate();
                    }
                }
                drop(slot);
                handle.tokens.is_empty()
            }
            None => false,
        };

        if last {
            if let Some(handle) = state.handles.remove(&key) {
                handle.teardown();
            }
            tracing::info!(key = %key, "closed subscription");
        }
        true
    }

    /// Releases every token and closes every subscription.
    pub fn close_all(&self) {
        let mut state = self.lock();
        state.tokens.clear();
        let handles: Vec<(SubscriptionKey, ChannelHandle)> = state.handles.drain().collect();
        drop(state);
        for (key, handle) in handles {
            handle.teardown();
            tracing::debug!(key = %key, "closed subscription");
        }
    }

    /// Number of keys with a handle.
    pub fn len(&self) -> usize {
        self.lock().handles.len()
    }

    /// True if no key has a handle.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every handle, ordered by key.
    pub fn status(&self) -> Vec<HandleStatus> {
        let state = self.lock();
        let mut entries: Vec<HandleStatus> = state
            .handles
            .iter()
            .map(|(key, handle)| {
                let slot = lock(&handle.slot);
                HandleStatus {
                    key: key.clone(),
                    listener: slot.listener.as_ref().map(|l| SubscriptionToken(l.token)),
                    tokens: handle.tokens.len(),
                    dead: slot.dead,
                }
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        lock(&self.state)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Reader task: normalizes feed items and hands them to the current listener.
async fn read_feed(
    key: SubscriptionKey,
    mut rx: FeedReceiver,
    slot: Arc<Mutex<Slot>>,
) {
    let reason = loop {
        match rx.recv().await {
            Some(FeedItem::Change(raw)) => {
                if let Some(event) = normalize(&raw) {
                    deliver(&key, &slot, Delivery::Event(event));
                }
            }
            Some(FeedItem::Lagged) => mark_lagged(&key, &slot),
            Some(FeedItem::Closed(reason)) => break reason,
            None => break "change feed ended".to_string(),
        }
    };

    let mut slot = lock(&slot);
    slot.dead = true;
    if let Some(listener) = slot.listener.as_mut() {
        *lock(&listener.shared.closed) = Some(reason.clone());
        // Buffered events drain first; the stream then reports the close.
        listener.tx = None;
    }
    tracing::warn!(key = %key, reason = %reason, "subscription dropped");
}

/// The feed itself dropped notifications for this key.
fn mark_lagged(key: &SubscriptionKey, slot: &Mutex<Slot>) {
    let slot = lock(slot);
    if let Some(listener) = slot.listener.as_ref() {
        listener.shared.lagged.store(true, Ordering::Release);
        tracing::warn!(key = %key, token = listener.token, "change feed overflowed");
    }
}

fn deliver(key: &SubscriptionKey, slot: &Mutex<Slot>, delivery: Delivery) {
    let slot = lock(slot);
    let Some(listener) = slot.listener.as_ref() else {
        tracing::trace!(key = %key, "no listener; delivery discarded");
        return;
    };
    let Some(tx) = listener.tx.as_ref() else {
        return;
    };
    match tx.try_send(delivery) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            listener.shared.lagged.store(true, Ordering::Release);
            tracing::warn!(key = %key, token = listener.token, "listener lagging; dropping delivery");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            tracing::debug!(key = %key, token = listener.token, "listener gone");
        }
    }
}
