//! Async trait implementations over the synchronous repositories.
//!
//! Every call hops onto the blocking pool so SQLite never runs on a runtime
//! worker thread.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use tracing::warn;

use parley_core::ids::{ConversationId, MessageId, UserId};
use parley_core::models::{Conversation, DirectConversation, Group, Message, ParticipantPair};
use parley_core::store::{Authenticator, ConversationDirectory, CursorStore, GroupAdmin, MessageStore};
use parley_core::ChatError;

use crate::conversations::ConversationRepo;
use crate::cursors::CursorRepo;
use crate::database::Database;
use crate::error::StoreError;
use crate::messages::MessageRepo;
use crate::tokens::TokenRepo;

struct Repos {
    conversations: ConversationRepo,
    messages: MessageRepo,
    cursors: CursorRepo,
    tokens: TokenRepo,
}

/// SQLite-backed implementation of every storage seam.
#[derive(Clone)]
pub struct SqliteChatStore {
    repos: Arc<Repos>,
}

impl SqliteChatStore {
    pub fn new(db: Database) -> Self {
        Self {
            repos: Arc::new(Repos {
                conversations: ConversationRepo::new(db.clone()),
                messages: MessageRepo::new(db.clone()),
                cursors: CursorRepo::new(db.clone()),
                tokens: TokenRepo::new(db),
            }),
        }
    }

    /// Mint a bearer token (operator tooling).
    pub async fn issue_token(&self, user: UserId, ttl: Option<Duration>) -> Result<String, ChatError> {
        self.blocking(move |r| r.tokens.issue(&user, ttl)).await
    }

    pub async fn revoke_token(&self, token: String) -> Result<bool, ChatError> {
        self.blocking(move |r| r.tokens.revoke(&token)).await
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T, ChatError>
    where
        F: FnOnce(&Repos) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let repos = self.repos.clone();
        match tokio::task::spawn_blocking(move || f(&repos)).await {
            Ok(res) => res.map_err(ChatError::from),
            Err(e) => {
                warn!(error = %e, "storage task failed");
                Err(ChatError::Transient(format!("storage task failed: {e}")))
            }
        }
    }
}

#[async_trait]
impl ConversationDirectory for SqliteChatStore {
    async fn get_or_create_direct(
        &self,
        a: &UserId,
        b: &UserId,
    ) -> Result<DirectConversation, ChatError> {
        let pair = ParticipantPair::new(a, b)?;
        self.blocking(move |r| r.conversations.get_or_create_direct(&pair)).await
    }

    async fn list_conversations_for(&self, user: &UserId) -> Result<Vec<Conversation>, ChatError> {
        let user = user.clone();
        self.blocking(move |r| r.conversations.list_for_user(&user)).await
    }

    async fn get(&self, id: &ConversationId) -> Result<Conversation, ChatError> {
        let id = id.clone();
        self.blocking(move |r| r.conversations.get(&id)).await
    }

    async fn members(&self, id: &ConversationId) -> Result<BTreeSet<UserId>, ChatError> {
        let id = id.clone();
        self.blocking(move |r| r.conversations.members(&id)).await
    }

    async fn joined_seq(&self, id: &ConversationId, user: &UserId) -> Result<i64, ChatError> {
        let (id, user) = (id.clone(), user.clone());
        self.blocking(move |r| r.conversations.joined_seq(&id, &user)).await
    }
}

#[async_trait]
impl GroupAdmin for SqliteChatStore {
    async fn create_group(
        &self,
        name: &str,
        creator: &UserId,
        members: &[UserId],
    ) -> Result<Group, ChatError> {
        let name = name.to_string();
        let creator = creator.clone();
        let members = members.to_vec();
        self.blocking(move |r| r.conversations.create_group(&name, &creator, &members))
            .await
    }

    async fn add_member(
        &self,
        group: &ConversationId,
        requester: &UserId,
        user: &UserId,
    ) -> Result<Group, ChatError> {
        let (group, requester, user) = (group.clone(), requester.clone(), user.clone());
        self.blocking(move |r| r.conversations.add_member(&group, &requester, &user))
            .await
    }

    async fn remove_member(
        &self,
        group: &ConversationId,
        requester: &UserId,
        user: &UserId,
    ) -> Result<Group, ChatError> {
        let (group, requester, user) = (group.clone(), requester.clone(), user.clone());
        self.blocking(move |r| r.conversations.remove_member(&group, &requester, &user))
            .await
    }

    async fn groups_for(&self, user: &UserId) -> Result<Vec<Group>, ChatError> {
        let user = user.clone();
        self.blocking(move |r| r.conversations.list_groups_for(&user)).await
    }
}

#[async_trait]
impl MessageStore for SqliteChatStore {
    async fn append(
        &self,
        conversation: &ConversationId,
        sender: &UserId,
        body: &str,
    ) -> Result<Message, ChatError> {
        let (conversation, sender, body) = (conversation.clone(), sender.clone(), body.to_string());
        self.blocking(move |r| r.messages.append(&conversation, &sender, &body))
            .await
    }

    async fn fetch_since(
        &self,
        conversation: &ConversationId,
        after_seq: i64,
        limit: u32,
    ) -> Result<Vec<Message>, ChatError> {
        let conversation = conversation.clone();
        self.blocking(move |r| r.messages.list_after_seq(&conversation, after_seq, limit))
            .await
    }

    async fn soft_delete(&self, message: &MessageId, requester: &UserId) -> Result<Message, ChatError> {
        let (message, requester) = (message.clone(), requester.clone());
        self.blocking(move |r| r.messages.soft_delete(&message, &requester))
            .await
    }

    async fn last_message(&self, conversation: &ConversationId) -> Result<Option<Message>, ChatError> {
        let conversation = conversation.clone();
        self.blocking(move |r| r.messages.last(&conversation)).await
    }
}

#[async_trait]
impl CursorStore for SqliteChatStore {
    async fn cursor(&self, user: &UserId, conversation: &ConversationId) -> Result<i64, ChatError> {
        let (user, conversation) = (user.clone(), conversation.clone());
        self.blocking(move |r| r.cursors.get(&user, &conversation)).await
    }

    async fn advance(
        &self,
        user: &UserId,
        conversation: &ConversationId,
        seq: i64,
    ) -> Result<i64, ChatError> {
        let (user, conversation) = (user.clone(), conversation.clone());
        self.blocking(move |r| r.cursors.advance(&user, &conversation, seq))
            .await
    }
}

#[async_trait]
impl Authenticator for SqliteChatStore {
    async fn authenticate(&self, token: &str) -> Result<UserId, ChatError> {
        let token = token.trim().to_string();
        if token.is_empty() {
            return Err(ChatError::Unauthorized("missing token".into()));
        }
        self.blocking(move |r| r.tokens.resolve(&token))
            .await?
            .ok_or_else(|| ChatError::Unauthorized("invalid or expired token".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn user(s: &str) -> UserId {
        UserId::from_raw(s)
    }

    fn store() -> SqliteChatStore {
        SqliteChatStore::new(Database::in_memory().unwrap())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_get_or_create_direct_yields_one_conversation() {
        let store = store();
        let mut tasks = Vec::new();
        for i in 0..32 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let (a, b) = if i % 2 == 0 { ("alice", "bob") } else { ("bob", "alice") };
                store.get_or_create_direct(&user(a), &user(b)).await.unwrap().id
            }));
        }
        let mut ids = HashSet::new();
        for t in tasks {
            ids.insert(t.await.unwrap());
        }
        assert_eq!(ids.len(), 1);
        assert_eq!(store.list_conversations_for(&user("alice")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn self_chat_is_invalid_participants() {
        let err = store()
            .get_or_create_direct(&user("alice"), &user("alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::InvalidParticipants(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_are_strictly_sequenced() {
        let store = store();
        let conv = store
            .get_or_create_direct(&user("alice"), &user("bob"))
            .await
            .unwrap()
            .id;
        let mut tasks = Vec::new();
        for i in 0..40 {
            let store = store.clone();
            let conv = conv.clone();
            tasks.push(tokio::spawn(async move {
                store.append(&conv, &user("alice"), &format!("m{i}")).await.unwrap().seq
            }));
        }
        let mut seqs = Vec::new();
        for t in tasks {
            seqs.push(t.await.unwrap());
        }
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=40).collect::<Vec<_>>());

        let all = store.fetch_since(&conv, 0, 100).await.unwrap();
        assert!(all.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[tokio::test]
    async fn authenticate_round_trip() {
        let store = store();
        let token = store.issue_token(user("alice"), None).await.unwrap();
        assert_eq!(store.authenticate(&token).await.unwrap(), user("alice"));

        let err = store.authenticate("plt_bogus").await.unwrap_err();
        assert!(matches!(err, ChatError::Unauthorized(_)));
        let err = store.authenticate("  ").await.unwrap_err();
        assert!(matches!(err, ChatError::Unauthorized(_)));

        assert!(store.revoke_token(token.clone()).await.unwrap());
        assert!(store.authenticate(&token).await.is_err());
    }

    #[tokio::test]
    async fn unknown_group_is_not_found() {
        let err = store()
            .add_member(&ConversationId::from_raw("conv_nope"), &user("a"), &user("b"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[tokio::test]
    async fn cursor_defaults_to_zero_and_advances() {
        let store = store();
        let conv = store
            .get_or_create_direct(&user("alice"), &user("bob"))
            .await
            .unwrap()
            .id;
        assert_eq!(store.cursor(&user("bob"), &conv).await.unwrap(), 0);
        store.advance(&user("bob"), &conv, 2).await.unwrap();
        store.advance(&user("bob"), &conv, 1).await.unwrap();
        assert_eq!(store.cursor(&user("bob"), &conv).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn joined_seq_marks_late_members() {
        let store = store();
        let g = store.create_group("ops", &user("alice"), &[user("bob")]).await.unwrap();
        store.append(&g.id, &user("alice"), "early").await.unwrap();
        store.add_member(&g.id, &user("alice"), &user("carol")).await.unwrap();
        assert_eq!(store.joined_seq(&g.id, &user("carol")).await.unwrap(), 1);
        assert_eq!(store.joined_seq(&g.id, &user("bob")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn groups_for_lists_memberships() {
        let store = store();
        store.create_group("ops", &user("alice"), &[user("bob")]).await.unwrap();
        assert_eq!(store.groups_for(&user("bob")).await.unwrap().len(), 1);
        assert!(store.groups_for(&user("carol")).await.unwrap().is_empty());
    }
}
