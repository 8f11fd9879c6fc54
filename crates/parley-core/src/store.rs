//! Persistence seams consumed by the delivery core.
//!
//! Implementations own durability and sequencing; the server only talks to
//! these traits.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::errors::ChatError;
use crate::ids::{ConversationId, MessageId, UserId};
use crate::models::{Conversation, DirectConversation, Group, Message};

/// Conversation identity and membership.
#[async_trait]
pub trait ConversationDirectory: Send + Sync {
    /// Lookup-or-create the single direct conversation for an unordered pair.
    async fn get_or_create_direct(
        &self,
        a: &UserId,
        b: &UserId,
    ) -> Result<DirectConversation, ChatError>;

    /// Every direct conversation and group the user takes part in.
    async fn list_conversations_for(&self, user: &UserId) -> Result<Vec<Conversation>, ChatError>;

    async fn get(&self, id: &ConversationId) -> Result<Conversation, ChatError>;

    /// Current member set, read fresh on every call.
    async fn members(&self, id: &ConversationId) -> Result<BTreeSet<UserId>, ChatError>;

    /// Highest seq `user` may not read: the conversation's last seq when
    /// they were added to a group, `0` otherwise.
    async fn joined_seq(&self, id: &ConversationId, user: &UserId) -> Result<i64, ChatError>;
}

/// Group lifecycle. Stands in for the group-management collaborator.
#[async_trait]
pub trait GroupAdmin: Send + Sync {
    async fn create_group(
        &self,
        name: &str,
        creator: &UserId,
        members: &[UserId],
    ) -> Result<Group, ChatError>;

    /// Only the creator may add members. Adding an existing member is a no-op.
    async fn add_member(
        &self,
        group: &ConversationId,
        requester: &UserId,
        user: &UserId,
    ) -> Result<Group, ChatError>;

    /// The creator may remove anyone; members may remove themselves. The last
    /// member cannot be removed.
    async fn remove_member(
        &self,
        group: &ConversationId,
        requester: &UserId,
        user: &UserId,
    ) -> Result<Group, ChatError>;

    /// Groups the user belongs to.
    async fn groups_for(&self, user: &UserId) -> Result<Vec<Group>, ChatError>;
}

/// Durable, ordered, append-only log per conversation.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message and assign it the next seq of its conversation.
    async fn append(
        &self,
        conversation: &ConversationId,
        sender: &UserId,
        body: &str,
    ) -> Result<Message, ChatError>;

    /// Messages with `seq > after_seq`, ascending, at most `limit`.
    async fn fetch_since(
        &self,
        conversation: &ConversationId,
        after_seq: i64,
        limit: u32,
    ) -> Result<Vec<Message>, ChatError>;

    /// Flag a message deleted. Only the sender may do this.
    async fn soft_delete(&self, message: &MessageId, requester: &UserId)
        -> Result<Message, ChatError>;

    async fn last_message(&self, conversation: &ConversationId)
        -> Result<Option<Message>, ChatError>;
}

/// Per (user, conversation) delivery cursors.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// `0` when nothing was delivered yet.
    async fn cursor(&self, user: &UserId, conversation: &ConversationId) -> Result<i64, ChatError>;

    /// Move the cursor forward to `seq`. Never moves it backwards; returns
    /// the resulting value.
    async fn advance(
        &self,
        user: &UserId,
        conversation: &ConversationId,
        seq: i64,
    ) -> Result<i64, ChatError>;
}

/// Bearer credential validation (identity system).
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<UserId, ChatError>;
}
