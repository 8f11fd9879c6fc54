//! Registry of live socket sessions, indexed by user and by subscribed
//! conversation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info};

use parley_core::ids::{ConnectionId, ConversationId, UserId};
use parley_core::protocol::CloseReason;

use crate::websocket::connection::ConnectionSession;

#[derive(Default)]
pub struct ConnectionRegistry {
    sessions: DashMap<ConnectionId, Arc<ConnectionSession>>,
    by_user: DashMap<UserId, HashSet<ConnectionId>>,
    by_conversation: DashMap<ConversationId, HashSet<ConnectionId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: Arc<ConnectionSession>) {
        let _ = self
            .by_user
            .entry(session.user_id.clone())
            .or_default()
            .insert(session.id.clone());
        debug!(session = %session.id, user_id = %session.user_id, "session registered");
        let _ = self.sessions.insert(session.id.clone(), session);
    }

    /// Remove a session and every index entry pointing at it. The indexes are
    /// cleaned from the session's own subscriptions even when it was already
    /// unregistered. Returns whether the session was still registered.
    pub fn unregister(&self, session: &ConnectionSession) -> bool {
        let removed = self.sessions.remove(&session.id).is_some();
        let _ = self.by_user.remove_if_mut(&session.user_id, |_, ids| {
            let _ = ids.remove(&session.id);
            ids.is_empty()
        });
        for conversation in session.subscriptions() {
            self.unindex(&conversation, &session.id);
        }
        if removed {
            debug!(session = %session.id, "session unregistered");
        }
        removed
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ConnectionSession>> {
        self.sessions.get(id).map(|s| s.value().clone())
    }

    /// Snapshot of a user's live sessions. Empty when offline.
    pub fn sessions_for(&self, user: &UserId) -> Vec<Arc<ConnectionSession>> {
        let Some(ids) = self.by_user.get(user).map(|ids| ids.value().clone()) else {
            return Vec::new();
        };
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    /// Mark `session` subscribed to `conversation`, starting catch-up at
    /// `after_seq`. Membership is checked by the caller. Returns `false` for a
    /// session that is closed or no longer registered.
    pub fn subscribe(
        &self,
        session: &ConnectionSession,
        conversation: &ConversationId,
        after_seq: i64,
        floor: i64,
    ) -> bool {
        if session.is_closed() {
            return false;
        }
        session.begin_catch_up(conversation, after_seq, floor);
        let _ = self
            .by_conversation
            .entry(conversation.clone())
            .or_default()
            .insert(session.id.clone());

        // Unregistered while the caller was awaiting; take the entry back out.
        if !self.sessions.contains_key(&session.id) {
            self.unindex(conversation, &session.id);
            let _ = session.unsubscribe(conversation);
            return false;
        }
        true
    }

    pub fn unsubscribe(&self, session: &ConnectionSession, conversation: &ConversationId) -> bool {
        self.unindex(conversation, &session.id);
        session.unsubscribe(conversation)
    }

    fn unindex(&self, conversation: &ConversationId, id: &ConnectionId) {
        let _ = self.by_conversation.remove_if_mut(conversation, |_, ids| {
            let _ = ids.remove(id);
            ids.is_empty()
        });
    }

    /// Sessions currently subscribed to a conversation.
    pub fn subscribers(&self, conversation: &ConversationId) -> Vec<Arc<ConnectionSession>> {
        let Some(ids) = self
            .by_conversation
            .get(conversation)
            .map(|ids| ids.value().clone())
        else {
            return Vec::new();
        };
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    /// Number of live sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Close and evict sessions idle for longer than `timeout`.
    pub fn reap_idle(&self, timeout: Duration) -> usize {
        let idle: Vec<Arc<ConnectionSession>> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_for() > timeout)
            .map(|entry| entry.value().clone())
            .collect();

        let mut removed = 0;
        for session in idle {
            if self.unregister(&session) {
                session.close(CloseReason::IdleTimeout);
                removed += 1;
                info!(session = %session.id, user_id = %session.user_id, "reaped idle session");
            }
        }
        removed
    }

    /// Close every session, e.g. on shutdown.
    pub fn close_all(&self, reason: CloseReason) {
        for entry in self.sessions.iter() {
            entry.value().close(reason);
        }
    }
}
