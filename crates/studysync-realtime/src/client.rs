//! Session-scoped entry point.

use std::sync::Arc;
use studysync_store::{ChangeFeed, IdentityProvider, RowStore};

use crate::aggregator::ConversationList;
use crate::collab::CollabSession;
use crate::message_stream::MessageStream;
use crate::registry::{HandleStatus, Registry};
use crate::{SyncError, SyncSettings};

/// Opens views for the signed-in user.
///
/// Owns the [`Registry`] for one sign-in session; every view it opens
/// shares it. Dropping a view releases its keys. Without a signed-in user
/// nothing is opened and no subscription is made.
pub struct SyncClient<B, I> {
    backend: Arc<B>,
    identity: Arc<I>,
    registry: Registry<B>,
    settings: SyncSettings,
}

impl<B, I> SyncClient<B, I>
where
    B: RowStore + ChangeFeed,
    I: IdentityProvider,
{
    pub fn new(backend: Arc<B>, identity: Arc<I>, settings: SyncSettings) -> Self {
        let registry = Registry::new(Arc::clone(&backend), settings.channel_capacity);
        Self {
            backend,
            identity,
            registry,
            settings,
        }
    }

    /// The signed-in user, or [`SyncError::Unauthenticated`].
    pub fn current_user(&self) -> Result<String, SyncError> {
        self.identity.current_user().ok_or(SyncError::Unauthenticated)
    }

    /// Opens the live message list of a conversation.
    pub async fn open_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<MessageStream<B>, SyncError> {
        let user_id = self.current_user()?;
        let mut stream = MessageStream::new(
            Arc::clone(&self.backend),
            self.registry.clone(),
            conversation_id,
            &user_id,
            &self.settings,
        );
        stream.open().await?;
        Ok(stream)
    }

    /// Opens the user's conversation list.
    pub async fn open_conversation_list(&self) -> Result<ConversationList<B>, SyncError> {
        let user_id = self.current_user()?;
        let mut list = ConversationList::new(
            Arc::clone(&self.backend),
            self.registry.clone(),
            &user_id,
            &self.settings,
        );
        list.open().await?;
        Ok(list)
    }

    /// Opens a collaborative document.
    pub async fn open_collab_session(
        &self,
        session_id: &str,
    ) -> Result<CollabSession<B>, SyncError> {
        let user_id = self.current_user()?;
        let mut session = CollabSession::new(
            Arc::clone(&self.backend),
            self.registry.clone(),
            session_id,
            &user_id,
        );
        session.open().await?;
        Ok(session)
    }

    pub fn registry(&self) -> &Registry<B> {
        &self.registry
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Live subscriptions, ordered by key.
    pub fn status(&self) -> Vec<HandleStatus> {
        self.registry.status()
    }

    /// Closes every subscription, e.g. on sign-out. Open views stop
    /// receiving deliveries.
    pub fn shutdown(&self) {
        self.registry.close_all();
        tracing::info!("sync client shut down");
    }
}
