//! Realtime synchronization for StudySync.
//!
//! Turns an unreliable, at-least-once row-change feed into consistent local
//! views:
//!
//! - [`Registry`]: at most one live feed subscription per
//!   [`SubscriptionKey`](studysync_types::SubscriptionKey), shared by
//!   re-subscribing screens.
//! - [`normalize`]: raw notification to typed [`ChangeEvent`](studysync_types::ChangeEvent).
//! - [`MessageStream`]: ordered, deduplicated message list with optimistic
//!   sends, plus read confirmation through [`ReadTracker`].
//! - [`ConversationList`]: conversation summaries recomputed from the store
//!   with per-conversation debouncing.
//! - [`CollabSession`]: last-writer-wins document content and an annotation
//!   set, on two independent keys.
//!
//! [`SyncClient`] ties them to the signed-in user. Views process one
//! delivery at a time through their `next()` method; failures of passive
//! processing come back as values, and only user-initiated writes return
//! errors.

mod aggregator;
mod client;
mod collab;
mod error;
mod message_list;
mod message_stream;
mod normalizer;
mod read_state;
mod registry;
mod settings;

pub use aggregator::{ConversationList, Debouncer, ListUpdate};
pub use client::SyncClient;
pub use collab::{CollabChannel, CollabDocument, CollabSession, CollabUpdate};
pub use error::SyncError;
pub use message_list::{Merge, MessageList, LOCAL_ID_PREFIX};
pub use message_stream::{MessageStream, PendingSend, StreamState, StreamUpdate};
pub use normalizer::{normalize, try_normalize};
pub use read_state::ReadTracker;
pub use registry::{
    bindings_for, Delivery, EventStream, HandleStatus, Registry, Subscription, SubscriptionToken,
};
pub use settings::SyncSettings;

/// Connection health of a view as shown to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    /// The subscription dropped; the view shows stale data until it
    /// reconnects.
    Reconnecting,
}
