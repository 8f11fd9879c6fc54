//! Fan-out of persisted messages to live sessions.
//!
//! Appenders enqueue an event once the message is committed and return. A
//! single worker drains the queue in order, so events for one conversation
//! reach every session in seq order. Membership is re-read for every event;
//! sessions whose user left the conversation are unsubscribed instead of
//! pushed to.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use parley_core::ids::{ConnectionId, ConversationId, UserId};
use parley_core::models::Message;
use parley_core::protocol::{CloseReason, ServerFrame};
use parley_core::store::ConversationDirectory;
use parley_core::ChatError;

use crate::config::RetryPolicy;
use crate::registry::ConnectionRegistry;
use crate::websocket::connection::{ConnectionSession, Offer};

#[derive(Clone, Debug)]
pub enum DispatchEvent {
    /// A newly appended message. `origin` is the socket session that sent it;
    /// that session gets an `ack` instead of a push.
    Message {
        message: Message,
        origin: Option<ConnectionId>,
    },
    /// A message was soft-deleted.
    Deleted(Message),
}

impl DispatchEvent {
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::Message { message, .. } | Self::Deleted(message) => &message.conversation_id,
        }
    }

    fn seq(&self) -> i64 {
        match self {
            Self::Message { message, .. } | Self::Deleted(message) => message.seq,
        }
    }
}

/// Cloneable handle for enqueueing fan-out work.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<DispatchEvent>,
}

impl Dispatcher {
    /// Start the dispatch worker. It stops when `cancel` fires or every
    /// handle has been dropped.
    pub fn spawn(
        registry: Arc<ConnectionRegistry>,
        directory: Arc<dyn ConversationDirectory>,
        capacity: usize,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = DispatchWorker {
            registry,
            directory,
            retry,
        };
        let handle = tokio::spawn(worker.run(rx, cancel));
        (Self { tx }, handle)
    }

    /// Queue an event. Waits for room when the queue is full.
    pub async fn enqueue(&self, event: DispatchEvent) -> Result<(), ChatError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| ChatError::Transient("dispatcher stopped".into()))
    }
}

struct DispatchWorker {
    registry: Arc<ConnectionRegistry>,
    directory: Arc<dyn ConversationDirectory>,
    retry: RetryPolicy,
}

impl DispatchWorker {
    async fn run(self, mut rx: mpsc::Receiver<DispatchEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => self.dispatch(event).await,
                    None => break,
                },
                () = cancel.cancelled() => break,
            }
        }
        debug!("dispatcher stopped");
    }

    #[instrument(skip_all, fields(conversation_id = %event.conversation_id(), seq = event.seq()))]
    async fn dispatch(&self, event: DispatchEvent) {
        let conversation = event.conversation_id();
        let subscribers = self.registry.subscribers(conversation);
        if subscribers.is_empty() {
            return;
        }

        let members = match self.members(conversation).await {
            Ok(members) => members,
            Err(e) => {
                // Without a membership answer nothing can be pushed safely.
                // Subscribed sessions are dropped and recover through catch-up.
                warn!(error = %e, sessions = subscribers.len(), "membership lookup failed, dropping subscribers");
                for session in subscribers {
                    self.drop_session(&session, CloseReason::TransportError);
                }
                return;
            }
        };

        for session in subscribers {
            if !members.contains(&session.user_id) {
                self.revoke(&session, conversation);
                continue;
            }
            let offer = match &event {
                DispatchEvent::Message { message, origin } => {
                    if origin.as_ref() == Some(&session.id) {
                        continue;
                    }
                    session.offer_message(message)
                }
                DispatchEvent::Deleted(message) => session.offer_tombstone(message),
            };
            match offer {
                Offer::Failed => {
                    warn!(session = %session.id, user_id = %session.user_id, dropped = session.drop_count(), "push failed, closing session");
                    self.drop_session(&session, CloseReason::TransportError);
                }
                other => debug!(session = %session.id, offer = ?other, "offered"),
            }
        }
    }

    async fn members(&self, conversation: &ConversationId) -> Result<BTreeSet<UserId>, ChatError> {
        let mut attempt = 1;
        loop {
            match self.directory.members(conversation).await {
                Ok(members) => return Ok(members),
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    debug!(attempt, ?delay, error = %e, "retrying membership lookup");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn revoke(&self, session: &ConnectionSession, conversation: &ConversationId) {
        if self.registry.unsubscribe(session, conversation) {
            debug!(session = %session.id, user_id = %session.user_id, "no longer a member, unsubscribed");
            let _ = session.send_frame(&ServerFrame::error(&ChatError::Forbidden(format!(
                "no longer a member of {conversation}"
            ))));
        }
    }

    fn drop_session(&self, session: &ConnectionSession, reason: CloseReason) {
        let _ = self.registry.unregister(session);
        session.close(reason);
    }
}
