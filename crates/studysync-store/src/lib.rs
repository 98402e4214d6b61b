//! Row store and change feed for StudySync.
//!
//! Persists conversations, messages, collaboration sessions and annotations
//! in SQLite and exposes them through the two seams the realtime layer is
//! written against:
//!
//! - [`RowStore`]: async bulk reads and writes.
//! - [`ChangeFeed`]: subscriptions that yield raw postgres_changes shaped
//!   notifications for every committed row change.
//!
//! [`SqliteBackend`] implements both. The query modules (`conversations`,
//! `messages`, `collab`) are plain synchronous functions over a
//! [`rusqlite::Connection`] so they can be tested without a runtime.

pub mod backend;
pub mod collab;
pub mod conversations;
mod error;
pub mod feed;
pub mod messages;

pub use backend::{
    IdentityProvider, NewAnnotation, NewMessage, RowStore, SqliteBackend, StaticIdentity,
};
pub use error::{FeedError, StoreError};
pub use feed::{
    ChangeFeed, FeedBinding, FeedGuard, FeedHub, FeedItem, FeedReceiver, FeedStream, RowFilter,
    DEFAULT_FEED_CAPACITY,
};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::Row;
use studysync_types::timestamp;

/// Reads a timestamp column written by [`timestamp::format`].
pub(crate) fn timestamp_column(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    timestamp::parse(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
