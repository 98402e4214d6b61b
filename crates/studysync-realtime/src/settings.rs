//! Runtime tunables for the sync layer.

use std::time::Duration;

/// Tunables shared by every view a [`crate::SyncClient`] opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    /// Window in which conversation recomputations are coalesced.
    pub debounce: Duration,

    /// How far a confirmed message's `created_at` may be from a pending
    /// copy's local time and still be matched to it by content.
    pub pending_match_window: chrono::Duration,

    /// Buffered deliveries per listener before the listener is marked lagged.
    pub channel_capacity: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(150),
            pending_match_window: chrono::Duration::seconds(30),
            channel_capacity: 256,
        }
    }
}
