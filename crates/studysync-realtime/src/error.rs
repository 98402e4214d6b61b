//! Error taxonomy of the sync layer.

use studysync_store::{FeedError, StoreError};
use studysync_types::SubscriptionKey;
use thiserror::Error;

/// Failures surfaced by views and the registry.
///
/// Passive feed processing never returns these across the event boundary:
/// connection loss is delivered as a value, malformed events are logged and
/// dropped. Only user-initiated writes and view setup return errors.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The subscription for `key` was dropped. Recover with `reconnect()`.
    #[error("subscription {key} dropped: {reason}")]
    TransientConnection {
        key: SubscriptionKey,
        reason: String,
    },

    /// A write failed; optimistic local state has been rolled back.
    #[error("{op} failed: {source}")]
    WriteFailure {
        op: &'static str,
        #[source]
        source: StoreError,
    },

    /// A change notification could not be interpreted.
    #[error("malformed change event: {0}")]
    MalformedEvent(String),

    /// There is no signed-in user; no subscriptions are made in guest mode.
    #[error("no signed-in user")]
    Unauthenticated,

    /// The view has not finished loading.
    #[error("{0} is not live")]
    NotLive(SubscriptionKey),

    /// A bulk read failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The change feed refused the subscription.
    #[error("change feed error: {0}")]
    Feed(#[from] FeedError),
}

impl SyncError {
    pub(crate) fn write(op: &'static str, source: StoreError) -> Self {
        Self::WriteFailure { op, source }
    }

    /// True for errors that a re-subscribe can fix.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientConnection { .. } | Self::Feed(_))
    }
}
