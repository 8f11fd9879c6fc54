//! Request-level operations shared by the REST handlers and the socket
//! session. Both paths funnel sends through [`ChatService::send_message`],
//! which persists the message and then hands it to the dispatcher.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use parley_core::ids::{ConnectionId, ConversationId, MessageId, UserId};
use parley_core::models::{Conversation, ConversationKind, ConversationSummary, Group, Message, WireMessage};
use parley_core::store::{Authenticator, ConversationDirectory, CursorStore, GroupAdmin, MessageStore};
use parley_core::ChatError;
use parley_store::SqliteChatStore;

use crate::config::ServerConfig;
use crate::dispatcher::{DispatchEvent, Dispatcher};

/// The storage seams the service talks to.
#[derive(Clone)]
pub struct Stores {
    pub directory: Arc<dyn ConversationDirectory>,
    pub groups: Arc<dyn GroupAdmin>,
    pub messages: Arc<dyn MessageStore>,
    pub cursors: Arc<dyn CursorStore>,
    pub auth: Arc<dyn Authenticator>,
}

impl Stores {
    /// Every seam backed by the same SQLite store.
    pub fn sqlite(store: SqliteChatStore) -> Self {
        let store = Arc::new(store);
        Self {
            directory: store.clone(),
            groups: store.clone(),
            messages: store.clone(),
            cursors: store.clone(),
            auth: store,
        }
    }
}

/// Per-conversation append lock. Held across append and enqueue so dispatch
/// events for one conversation are queued in seq order. Entries live only
/// while someone holds or waits for them.
#[derive(Default)]
struct ConversationLocks {
    locks: Mutex<HashMap<ConversationId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConversationLocks {
    async fn acquire(&self, conversation: &ConversationId) -> AppendGuard<'_> {
        let lock = self
            .locks
            .lock()
            .entry(conversation.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        AppendGuard {
            locks: self,
            conversation: conversation.clone(),
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

struct AppendGuard<'a> {
    locks: &'a ConversationLocks,
    conversation: ConversationId,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for AppendGuard<'_> {
    fn drop(&mut self) {
        // The map lock stops new holders from cloning the entry while the
        // count is checked.
        let mut locks = self.locks.locks.lock();
        drop(self.guard.take());
        if locks
            .get(&self.conversation)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            let _ = locks.remove(&self.conversation);
        }
    }
}

pub struct ChatService {
    stores: Stores,
    dispatcher: Dispatcher,
    config: Arc<ServerConfig>,
    locks: ConversationLocks,
}

impl ChatService {
    pub fn new(stores: Stores, dispatcher: Dispatcher, config: Arc<ServerConfig>) -> Self {
        Self {
            stores,
            dispatcher,
            config,
            locks: ConversationLocks::default(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn authenticate(&self, token: &str) -> Result<UserId, ChatError> {
        self.stores.auth.authenticate(token).await
    }

    /// Load a conversation and check that `user` belongs to it.
    pub async fn ensure_member(
        &self,
        conversation: &ConversationId,
        user: &UserId,
    ) -> Result<Conversation, ChatError> {
        let conv = self.stores.directory.get(conversation).await?;
        if !conv.has_member(user) {
            return Err(ChatError::Forbidden(format!("not a member of {conversation}")));
        }
        Ok(conv)
    }

    /// Highest seq hidden from `user`: group history from before they joined.
    pub async fn join_floor(&self, conversation: &ConversationId, user: &UserId) -> Result<i64, ChatError> {
        self.stores.directory.joined_seq(conversation, user).await
    }

    /// Validate, persist and fan out a message. Returns once the message is
    /// durable; pushes happen asynchronously.
    #[instrument(skip(self, text), fields(conversation_id = %conversation, sender = %sender))]
    pub async fn send_message(
        &self,
        sender: &UserId,
        conversation: &ConversationId,
        text: &str,
        origin: Option<ConnectionId>,
    ) -> Result<Message, ChatError> {
        let body = text.trim();
        if body.is_empty() {
            return Err(ChatError::InvalidRequest("message text is empty".into()));
        }
        if body.len() > self.config.max_body_len {
            return Err(ChatError::InvalidRequest(format!(
                "message text exceeds {} bytes",
                self.config.max_body_len
            )));
        }
        let _ = self.ensure_member(conversation, sender).await?;

        let _guard = self.locks.acquire(conversation).await;
        let message = self.append_with_retry(conversation, sender, body).await?;
        debug!(seq = message.seq, message_id = %message.id, "message persisted");

        let event = DispatchEvent::Message {
            message: message.clone(),
            origin,
        };
        if let Err(e) = self.dispatcher.enqueue(event).await {
            // Durable already; subscribers pick it up on their next catch-up.
            warn!(error = %e, seq = message.seq, "dispatch unavailable");
        }
        Ok(message)
    }

    async fn append_with_retry(
        &self,
        conversation: &ConversationId,
        sender: &UserId,
        body: &str,
    ) -> Result<Message, ChatError> {
        let retry = &self.config.retry;
        let mut attempt = 1;
        loop {
            match self.stores.messages.append(conversation, sender, body).await {
                Ok(message) => return Ok(message),
                Err(e) if e.is_retryable() && attempt < retry.max_attempts => {
                    let delay = retry.delay_for(attempt);
                    warn!(attempt, ?delay, error = %e, "append failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Soft-delete a message (sender only) and notify live subscribers.
    #[instrument(skip(self), fields(message_id = %message, requester = %requester))]
    pub async fn delete_message(
        &self,
        requester: &UserId,
        message: &MessageId,
    ) -> Result<Message, ChatError> {
        let tombstone = self.stores.messages.soft_delete(message, requester).await?;
        info!(conversation_id = %tombstone.conversation_id, seq = tombstone.seq, "message deleted");
        if let Err(e) = self.dispatcher.enqueue(DispatchEvent::Deleted(tombstone.clone())).await {
            warn!(error = %e, "dispatch unavailable for tombstone");
        }
        Ok(tombstone)
    }

    /// One page of history after `after`. The second value tells whether more
    /// messages follow the page.
    pub async fn history(
        &self,
        user: &UserId,
        conversation: &ConversationId,
        after: Option<i64>,
        limit: Option<u32>,
    ) -> Result<(Vec<Message>, bool), ChatError> {
        let _ = self.ensure_member(conversation, user).await?;
        let floor = self.join_floor(conversation, user).await?;
        let limit = self.config.page_limit(limit);
        let after = after.unwrap_or(0).max(floor);
        let mut page = self
            .stores
            .messages
            .fetch_since(conversation, after, limit.saturating_add(1))
            .await?;
        let has_more = page.len() > limit as usize;
        page.truncate(limit as usize);
        Ok((page, has_more))
    }

    /// Raw catch-up read. Membership is checked by the caller.
    pub async fn backlog_page(
        &self,
        conversation: &ConversationId,
        after: i64,
        limit: u32,
    ) -> Result<Vec<Message>, ChatError> {
        self.stores.messages.fetch_since(conversation, after, limit).await
    }

    pub async fn cursor(&self, user: &UserId, conversation: &ConversationId) -> Result<i64, ChatError> {
        self.stores.cursors.cursor(user, conversation).await
    }

    pub async fn advance_cursor(
        &self,
        user: &UserId,
        conversation: &ConversationId,
        seq: i64,
    ) -> Result<i64, ChatError> {
        self.stores.cursors.advance(user, conversation, seq).await
    }

    /// The caller's conversations with their newest message, most recently
    /// active first.
    pub async fn conversations_for(&self, user: &UserId) -> Result<Vec<ConversationSummary>, ChatError> {
        let conversations = self.stores.directory.list_conversations_for(user).await?;
        self.summarize(user, conversations).await
    }

    pub async fn direct_chats_for(&self, user: &UserId) -> Result<Vec<ConversationSummary>, ChatError> {
        let conversations = self
            .stores
            .directory
            .list_conversations_for(user)
            .await?
            .into_iter()
            .filter(|c| c.kind() == ConversationKind::Direct)
            .collect();
        self.summarize(user, conversations).await
    }

    async fn summarize(
        &self,
        user: &UserId,
        conversations: Vec<Conversation>,
    ) -> Result<Vec<ConversationSummary>, ChatError> {
        let mut summaries = Vec::with_capacity(conversations.len());
        for conversation in conversations {
            let floor = match &conversation {
                Conversation::Group(_) => self.join_floor(conversation.id(), user).await?,
                Conversation::Direct(_) => 0,
            };
            let last = self
                .stores
                .messages
                .last_message(conversation.id())
                .await?
                .filter(|m| m.seq > floor);
            summaries.push(ConversationSummary {
                last_message: last.as_ref().map(WireMessage::from),
                conversation,
            });
        }
        summaries.sort_by(|a, b| activity(b).cmp(activity(a)));
        Ok(summaries)
    }

    /// Find or create the direct conversation between the caller and
    /// `recipient`.
    #[instrument(skip(self), fields(user = %user, recipient = %recipient))]
    pub async fn start_direct(&self, user: &UserId, recipient: &UserId) -> Result<Conversation, ChatError> {
        let direct = self.stores.directory.get_or_create_direct(user, recipient).await?;
        Ok(Conversation::Direct(direct))
    }

    pub async fn create_group(
        &self,
        creator: &UserId,
        name: &str,
        members: &[UserId],
    ) -> Result<Group, ChatError> {
        let group = self.stores.groups.create_group(name, creator, members).await?;
        info!(group_id = %group.id, members = group.members.len(), "group created");
        Ok(group)
    }

    pub async fn add_member(
        &self,
        requester: &UserId,
        group: &ConversationId,
        user: &UserId,
    ) -> Result<Group, ChatError> {
        self.stores.groups.add_member(group, requester, user).await
    }

    pub async fn remove_member(
        &self,
        requester: &UserId,
        group: &ConversationId,
        user: &UserId,
    ) -> Result<Group, ChatError> {
        self.stores.groups.remove_member(group, requester, user).await
    }

    pub async fn groups_for(&self, user: &UserId) -> Result<Vec<Group>, ChatError> {
        self.stores.groups.groups_for(user).await
    }
}

fn activity(summary: &ConversationSummary) -> &str {
    summary
        .last_message
        .as_ref()
        .map_or(summary.conversation.created_at(), |m| m.created_at.as_str())
}
