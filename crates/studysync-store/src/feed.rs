//! Row-change feed.
//!
//! [`ChangeFeed`] is the subscribe primitive the realtime layer consumes: a
//! subscription names one or more collections (optionally filtered on a
//! column) and the operations of interest, and yields raw postgres_changes
//! shaped JSON notifications until it is cancelled or the feed closes it.
//!
//! [`FeedHub`] is the in-process implementation used by the SQLite backend.
//! Writes call [`FeedHub::publish`] once per affected row after commit.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use studysync_types::{timestamp, Collection, Operation};
use tokio::sync::mpsc;

use crate::error::FeedError;

/// Default per-subscriber buffer.
pub const DEFAULT_FEED_CAPACITY: usize = 256;

/// Column filter applied to the changed row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowFilter {
    /// `column = value`
    Eq { column: String, value: String },
    /// `column in (values)`
    In { column: String, values: Vec<String> },
}

impl RowFilter {
    /// Shorthand for an equality filter.
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Eq {
            column: column.into(),
            value: value.into(),
        }
    }

    fn matches(&self, row: &Value) -> bool {
        let cell = |column: &str| match row.get(column) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(Value::Bool(b)) => Some(b.to_string()),
            _ => None,
        };
        match self {
            Self::Eq { column, value } => cell(column).as_deref() == Some(value.as_str()),
            Self::In { column, values } => {
                cell(column).is_some_and(|c| values.iter().any(|v| *v == c))
            }
        }
    }
}

/// One `(collection, filter, operations)` clause of a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedBinding {
    pub collection: Collection,
    pub filter: Option<RowFilter>,
    pub operations: Vec<Operation>,
}

impl FeedBinding {
    /// Binds every operation on a collection.
    pub fn all(collection: Collection) -> Self {
        Self {
            collection,
            filter: None,
            operations: Operation::ALL.to_vec(),
        }
    }

    /// Restricts the binding with a row filter.
    pub fn filtered(mut self, filter: RowFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Restricts the binding to the given operations.
    pub fn only(mut self, operations: &[Operation]) -> Self {
        self.operations = operations.to_vec();
        self
    }

    fn matches(&self, collection: Collection, operation: Operation, row: &Value) -> bool {
        self.collection == collection
            && self.operations.contains(&operation)
            && self.filter.as_ref().map_or(true, |f| f.matches(row))
    }
}

/// An item delivered on a feed subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedItem {
    /// A raw change notification. Not schema-guaranteed.
    Change(Value),
    /// Notifications were dropped because the subscriber's buffer was full.
    /// The consumer should refetch whatever it derives from this feed.
    Lagged,
    /// The subscription was terminated by the feed. Nothing follows.
    Closed(String),
}

/// Receiving side of a subscription.
///
/// An overflow recorded by the hub is reported as one [`FeedItem::Lagged`]
/// ahead of the next buffered item.
#[derive(Debug)]
pub struct FeedReceiver {
    rx: mpsc::Receiver<FeedItem>,
    overflowed: Arc<AtomicBool>,
}

impl FeedReceiver {
    /// Waits for the next item. `None` means the feed dropped the sender.
    pub async fn recv(&mut self) -> Option<FeedItem> {
        if self.overflowed.swap(false, Ordering::AcqRel) {
            return Some(FeedItem::Lagged);
        }
        self.rx.recv().await
    }

    /// Returns the next item if one is ready.
    pub fn try_recv(&mut self) -> Option<FeedItem> {
        if self.overflowed.swap(false, Ordering::AcqRel) {
            return Some(FeedItem::Lagged);
        }
        self.rx.try_recv().ok()
    }

    /// Stops accepting items. Already buffered items can still be read.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

type Canceller = Box<dyn FnOnce() + Send>;

/// Unsubscribe hook of a [`FeedStream`]. Runs on [`FeedGuard::cancel`] or drop.
pub struct FeedGuard(Option<Canceller>);

impl FeedGuard {
    /// Unsubscribes now. Later calls do nothing.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.0.take() {
            cancel();
        }
    }

    /// Returns true once the hook has run.
    pub fn is_cancelled(&self) -> bool {
        self.0.is_none()
    }
}

impl Drop for FeedGuard {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// A live feed subscription.
///
/// Cancelling (explicitly or by dropping) unregisters the subscription.
pub struct FeedStream {
    rx: FeedReceiver,
    guard: FeedGuard,
}

impl FeedStream {
    /// Wraps a receiver and the function that unsubscribes it.
    pub fn new(rx: mpsc::Receiver<FeedItem>, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self::with_overflow_flag(rx, Arc::new(AtomicBool::new(false)), cancel)
    }

    /// Like [`FeedStream::new`], with a flag the producer sets when it drops
    /// items for this subscription.
    pub fn with_overflow_flag(
        rx: mpsc::Receiver<FeedItem>,
        overflowed: Arc<AtomicBool>,
        cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            rx: FeedReceiver { rx, overflowed },
            guard: FeedGuard(Some(Box::new(cancel))),
        }
    }

    /// Waits for the next item. `None` means the feed dropped the sender.
    pub async fn recv(&mut self) -> Option<FeedItem> {
        self.rx.recv().await
    }

    /// Unsubscribes. Items already buffered are discarded.
    pub fn cancel(&mut self) {
        self.guard.cancel();
        self.rx.close();
    }

    /// Splits the stream so the receiver can move into a reader task while
    /// the owner keeps the hook that tears the subscription down.
    pub fn into_parts(self) -> (FeedReceiver, FeedGuard) {
        (self.rx, self.guard)
    }
}

impl std::fmt::Debug for FeedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedStream")
            .field("cancelled", &self.guard.is_cancelled())
            .finish()
    }
}

/// The subscribe primitive of the backend.
pub trait ChangeFeed: Send + Sync + 'static {
    /// Opens a subscription over the given bindings.
    fn subscribe(&self, bindings: Vec<FeedBinding>) -> Result<FeedStream, FeedError>;
}

struct Subscriber {
    bindings: Vec<FeedBinding>,
    tx: mpsc::Sender<FeedItem>,
    overflowed: Arc<AtomicBool>,
}

struct HubState {
    next_id: u64,
    capacity: usize,
    subscribers: HashMap<u64, Subscriber>,
}

/// In-process change feed.
///
/// Uses a `std::sync::Mutex`: every critical section is a short map
/// operation and none spans an `.await`.
#[derive(Clone)]
pub struct FeedHub {
    state: Arc<Mutex<HubState>>,
}

impl Default for FeedHub {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_FEED_CAPACITY)
    }
}

impl FeedHub {
    /// Creates a hub whose subscribers buffer up to `capacity` items.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState {
                next_id: 0,
                capacity: capacity.max(1),
                subscribers: HashMap::new(),
            })),
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Publishes one row change to every matching subscriber.
    ///
    /// `new` is the row after the change (inserts, updates), `old` the row
    /// before it (updates, deletes).
    pub fn publish(
        &self,
        collection: Collection,
        operation: Operation,
        new: Option<Value>,
        old: Option<Value>,
    ) {
        let row = match operation {
            Operation::Delete => old.clone(),
            Operation::Insert | Operation::Update => new.clone(),
        }
        .unwrap_or(Value::Null);

        let payload = json!({
            "schema": "public",
            "table": collection.as_str(),
            "eventType": operation.as_str(),
            "new": new.unwrap_or_else(|| json!({})),
            "old": old.unwrap_or_else(|| json!({})),
            "commit_timestamp": timestamp::format(&chrono::Utc::now()),
            "errors": null,
        });

        self.deliver(|bindings| {
            bindings
                .iter()
                .any(|b| b.matches(collection, operation, &row))
        }, &payload);
    }

    /// Delivers an arbitrary payload as if it came off the wire.
    ///
    /// Routed by its `table`/`eventType`/row fields when they parse; a
    /// payload that cannot be routed goes to every subscriber, the way a
    /// corrupted frame would reach whoever is listening.
    pub fn inject(&self, payload: Value) {
        let collection = payload
            .get("table")
            .and_then(Value::as_str)
            .and_then(|t| t.parse::<Collection>().ok());
        let operation = payload
            .get("eventType")
            .and_then(Value::as_str)
            .and_then(|t| t.parse::<Operation>().ok());

        match (collection, operation) {
            (Some(collection), Some(operation)) => {
                let side = if operation == Operation::Delete { "old" } else { "new" };
                let row = payload.get(side).cloned().unwrap_or(Value::Null);
                self.deliver(
                    |bindings| bindings.iter().any(|b| b.matches(collection, operation, &row)),
                    &payload,
                );
            }
            _ => self.deliver(|_| true, &payload),
        }
    }

    /// Terminates every subscription with [`FeedItem::Closed`].
    pub fn disconnect_all(&self, reason: &str) {
        let drained: Vec<(u64, Subscriber)> = self.lock().subscribers.drain().collect();
        for (id, subscriber) in drained {
            if let Err(e) = subscriber.tx.try_send(FeedItem::Closed(reason.to_string())) {
                tracing::warn!(subscription = id, "failed to deliver feed close: {}", e);
            }
        }
        tracing::info!(reason, "change feed disconnected all subscribers");
    }

    fn deliver(&self, wants: impl Fn(&[FeedBinding]) -> bool, payload: &Value) {
        let mut state = self.lock();
        let mut closed = Vec::new();
        for (id, subscriber) in &state.subscribers {
            if !wants(&subscriber.bindings) {
                continue;
            }
            match subscriber.tx.try_send(FeedItem::Change(payload.clone())) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    subscriber.overflowed.store(true, Ordering::Release);
                    tracing::warn!(
                        subscription = id,
                        "dropping change notification for slow consumer"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
            }
        }
        for id in closed {
            state.subscribers.remove(&id);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubState> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ChangeFeed for FeedHub {
    fn subscribe(&self, bindings: Vec<FeedBinding>) -> Result<FeedStream, FeedError> {
        if bindings.is_empty() {
            return Err(FeedError::NoBindings);
        }

        let overflowed = Arc::new(AtomicBool::new(false));
        let (id, rx) = {
            let mut state = self.lock();
            let id = state.next_id;
            state.next_id += 1;
            let (tx, rx) = mpsc::channel(state.capacity);
            state.subscribers.insert(
                id,
                Subscriber {
                    bindings,
                    tx,
                    overflowed: Arc::clone(&overflowed),
                },
            );
            (id, rx)
        };
        tracing::debug!(subscription = id, "opened change feed subscription");

        let hub = self.clone();
        Ok(FeedStream::with_overflow_flag(rx, overflowed, move || {
            if hub.lock().subscribers.remove(&id).is_some() {
                tracing::debug!(subscription = id, "closed change feed subscription");
            }
        }))
    }
}
