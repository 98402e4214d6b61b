//! Read-state tracking.
//!
//! Marking a conversation read works on the message list after merge, never
//! on raw feed events: only messages the list has already observed are
//! marked, and the write names them by id so a message that arrives while
//! the write is in flight stays unread.

use studysync_store::RowStore;

use crate::message_list::MessageList;
use crate::SyncError;

/// Tracks and confirms read state for one reader.
#[derive(Debug, Clone)]
pub struct ReadTracker {
    reader_id: String,
}

impl ReadTracker {
    pub fn new(reader_id: impl Into<String>) -> Self {
        Self {
            reader_id: reader_id.into(),
        }
    }

    pub fn reader_id(&self) -> &str {
        &self.reader_id
    }

    /// Unread messages from others in `list`.
    pub fn unread(&self, list: &MessageList) -> u32 {
        list.unread_count(&self.reader_id)
    }

    /// Marks every observed unread message from others as read.
    ///
    /// The list is updated before the write is issued and rolled back if the
    /// write fails. Returns how many messages changed; zero means there was
    /// nothing to do and no write was made.
    pub async fn mark_read<S: RowStore>(
        &self,
        store: &S,
        list: &mut MessageList,
    ) -> Result<usize, SyncError> {
        let ids = list.mark_read_locally(&self.reader_id);
        if ids.is_empty() {
            return Ok(0);
        }

        let conversation_id = list.conversation_id().to_string();
        match store
            .mark_read(&conversation_id, &self.reader_id, ids.clone())
            .await
        {
            Ok(updated) => {
                tracing::debug!(
                    conversation_id = %conversation_id,
                    marked = ids.len(),
                    written = updated.len(),
                    "marked conversation read"
                );
                Ok(ids.len())
            }
            Err(e) => {
                list.restore_unread(&ids);
                tracing::warn!(conversation_id = %conversation_id, "mark read failed: {}", e);
                Err(SyncError::write("mark_read", e))
            }
        }
    }
}
