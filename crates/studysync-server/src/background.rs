//! Background tasks for the sync agent.
//!
//! Includes:
//! - Keeping the conversation list live and publishing it for `/status`.

use std::sync::{Arc, RwLock};
use std::time::Duration;
use studysync_realtime::{ConversationList, ListUpdate};
use studysync_store::{ChangeFeed, RowStore};
use studysync_types::ConversationSummary;
use tokio::time::sleep;

/// Latest conversation summaries, shared with the HTTP handlers.
pub type SummarySnapshot = Arc<RwLock<Vec<ConversationSummary>>>;

const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(10);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Drives a conversation list until its subscription is closed.
///
/// The snapshot is refreshed whenever the list changes. A dropped
/// subscription is retried with a doubling delay starting at
/// `reconnect_delay`, capped at thirty seconds.
pub async fn run_conversation_list<B>(
    mut list: ConversationList<B>,
    snapshot: SummarySnapshot,
    reconnect_delay: Duration,
) where
    B: RowStore + ChangeFeed,
{
    publish(&snapshot, &list);
    tracing::info!(key = %list.key(), "conversation list task started");

    while let Some(update) = list.next().await {
        match update {
            ListUpdate::Recomputed(_) | ListUpdate::Removed(_) | ListUpdate::Reloaded => {
                publish(&snapshot, &list);
            }
            ListUpdate::ReloadFailed(e) => {
                tracing::warn!(key = %list.key(), "conversation list may be stale: {}", e);
            }
            ListUpdate::Reconnecting(e) => {
                tracing::warn!(key = %list.key(), "conversation list disconnected: {}", e);
                let mut delay = reconnect_delay.max(MIN_RECONNECT_DELAY);
                loop {
                    sleep(delay).await;
                    match list.reconnect().await {
                        Ok(()) => {
                            tracing::info!(key = %list.key(), "conversation list reconnected");
                            publish(&snapshot, &list);
                            break;
                        }
                        Err(e) => {
                            delay = (delay * 2).min(MAX_RECONNECT_DELAY);
                            tracing::warn!(
                                key = %list.key(),
                                retry_in_ms = delay.as_millis() as u64,
                                "reconnect failed: {}",
                                e
                            );
                        }
                    }
                }
            }
            ListUpdate::Scheduled(_) | ListUpdate::Coalesced(_) | ListUpdate::Ignored => {}
        }
    }

    tracing::info!(key = %list.key(), "conversation list task stopped");
}

fn publish<B>(snapshot: &SummarySnapshot, list: &ConversationList<B>) {
    let mut guard = snapshot
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *guard = list.summaries().to_vec();
}
