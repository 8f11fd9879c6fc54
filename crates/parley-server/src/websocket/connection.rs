//! Live socket session state.
//!
//! Each subscription is either catching up (live pushes are buffered while
//! the backlog is replayed) or live. `last_pushed` is the highest seq already
//! handed to the writer for that conversation; live pushes at or below it are
//! dropped, which keeps backlog + live delivery duplicate-free.
//!
//! Catch-up runs on the session's own reader task and waits for queue space.
//! Live offers come from the dispatcher and never wait.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use parley_core::ids::{ConnectionId, ConversationId, UserId};
use parley_core::models::{Message, WireMessage};
use parley_core::protocol::{CloseReason, ServerFrame};

/// A frame queued for the socket writer. `delivered` names the
/// (conversation, seq) whose delivery cursor may advance once the frame is
/// written.
#[derive(Debug)]
pub struct Outbound {
    pub frame: Arc<String>,
    pub delivered: Option<(ConversationId, i64)>,
}

/// Outcome of offering a live event to a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Offer {
    Sent,
    Buffered,
    /// Already covered by an earlier push or backlog page.
    Duplicate,
    NotSubscribed,
    /// Queue full or closed; the session should be dropped.
    Failed,
}

#[derive(Debug)]
enum Pending {
    Message(Message),
    Deleted(Message),
}

#[derive(Debug)]
enum SubscriptionState {
    CatchingUp { pending: VecDeque<Pending> },
    Live,
}

#[derive(Debug)]
struct Subscription {
    state: SubscriptionState,
    last_pushed: i64,
    /// Messages at or below this seq predate the user's membership.
    floor: i64,
}

/// One authenticated socket connection.
pub struct ConnectionSession {
    pub id: ConnectionId,
    pub user_id: UserId,
    tx: mpsc::Sender<Outbound>,
    max_pending: usize,
    subscriptions: Mutex<HashMap<ConversationId, Subscription>>,
    pub connected_at: Instant,
    is_alive: AtomicBool,
    last_activity: Mutex<Instant>,
    dropped_frames: AtomicU64,
    cancel: CancellationToken,
    close_reason: Mutex<Option<CloseReason>>,
}

impl ConnectionSession {
    /// `max_pending` bounds the per-conversation catch-up buffer.
    pub fn new(user_id: UserId, tx: mpsc::Sender<Outbound>, max_pending: usize) -> Self {
        let now = Instant::now();
        Self {
            id: ConnectionId::new(),
            user_id,
            tx,
            max_pending,
            subscriptions: Mutex::new(HashMap::new()),
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_activity: Mutex::new(now),
            dropped_frames: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            close_reason: Mutex::new(None),
        }
    }

    /// Queue a control frame (ready, ack, error).
    pub fn send_frame(&self, frame: &ServerFrame) -> bool {
        match frame.to_json() {
            Ok(json) => self.enqueue(Outbound {
                frame: Arc::new(json),
                delivered: None,
            }),
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize frame");
                false
            }
        }
    }

    fn enqueue(&self, outbound: Outbound) -> bool {
        if self.tx.try_send(outbound).is_ok() {
            true
        } else {
            let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Wait for a free queue slot. `None` once the session is closed or the
    /// writer is gone.
    async fn reserve(&self) -> Option<mpsc::Permit<'_, Outbound>> {
        tokio::select! {
            permit = self.tx.reserve() => permit.ok(),
            () = self.cancel.cancelled() => None,
        }
    }

    /// Frames that could not be queued.
    pub fn drop_count(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Start (or restart) catch-up for a conversation from `after_seq`.
    /// Tombstones at or below `floor` are never delivered.
    pub fn begin_catch_up(&self, conversation: &ConversationId, after_seq: i64, floor: i64) {
        let _ = self.subscriptions.lock().insert(
            conversation.clone(),
            Subscription {
                state: SubscriptionState::CatchingUp {
                    pending: VecDeque::new(),
                },
                last_pushed: after_seq.max(floor),
                floor,
            },
        );
    }

    /// Queue one intermediate backlog page, waiting for queue space. Returns
    /// `false` if the session is no longer subscribed or has closed.
    pub async fn push_backlog(&self, conversation: &ConversationId, page: &[Message]) -> bool {
        let Some(permit) = self.reserve().await else {
            return false;
        };
        let mut subs = self.subscriptions.lock();
        let Some(sub) = subs.get_mut(conversation) else {
            return false;
        };
        send_backlog(conversation, sub, page, false, permit)
    }

    /// Queue the final backlog page, then drain whatever was buffered during
    /// catch-up one slot at a time. The switch to live happens under the
    /// subscription lock once the buffer is empty, so no concurrent offer can
    /// slip between the last buffered item and the first live push.
    pub async fn finish_catch_up(&self, conversation: &ConversationId, page: &[Message]) -> bool {
        let Some(permit) = self.reserve().await else {
            return false;
        };
        {
            let mut subs = self.subscriptions.lock();
            let Some(sub) = subs.get_mut(conversation) else {
                return false;
            };
            if !send_backlog(conversation, sub, page, true, permit) {
                return false;
            }
        }

        loop {
            {
                let mut subs = self.subscriptions.lock();
                let Some(sub) = subs.get_mut(conversation) else {
                    return false;
                };
                let drained = match &sub.state {
                    SubscriptionState::CatchingUp { pending } => pending.is_empty(),
                    SubscriptionState::Live => true,
                };
                if drained {
                    sub.state = SubscriptionState::Live;
                    return true;
                }
            }

            // Only this task pops the buffer, so the item is still there
            // once a slot frees up.
            let Some(permit) = self.reserve().await else {
                return false;
            };
            let mut subs = self.subscriptions.lock();
            let Some(sub) = subs.get_mut(conversation) else {
                return false;
            };
            let next = match &mut sub.state {
                SubscriptionState::CatchingUp { pending } => pending.pop_front(),
                SubscriptionState::Live => None,
            };
            let Some(item) = next else {
                continue;
            };
            let outbound = match &item {
                Pending::Message(m) => live_outbound(sub, m),
                Pending::Deleted(m) => tombstone_outbound(sub, m),
            };
            match outbound {
                Ok(Some(out)) => {
                    if let Pending::Message(m) = &item {
                        sub.last_pushed = m.seq;
                    }
                    permit.send(out);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(error = %e, "failed to serialize buffered frame");
                    return false;
                }
            }
        }
    }

    /// Offer a freshly persisted message.
    pub fn offer_message(&self, message: &Message) -> Offer {
        let mut subs = self.subscriptions.lock();
        let Some(sub) = subs.get_mut(&message.conversation_id) else {
            return Offer::NotSubscribed;
        };
        if let SubscriptionState::CatchingUp { pending } = &mut sub.state {
            if pending.len() >= self.max_pending {
                return Offer::Failed;
            }
            pending.push_back(Pending::Message(message.clone()));
            return Offer::Buffered;
        }
        match live_outbound(sub, message) {
            Ok(Some(out)) => {
                if self.enqueue(out) {
                    sub.last_pushed = message.seq;
                    trace!(session = %self.id, seq = message.seq, "pushed message");
                    Offer::Sent
                } else {
                    Offer::Failed
                }
            }
            Ok(None) => Offer::Duplicate,
            Err(_) => Offer::Failed,
        }
    }

    /// Offer a tombstone for a deleted message.
    pub fn offer_tombstone(&self, message: &Message) -> Offer {
        let mut subs = self.subscriptions.lock();
        let Some(sub) = subs.get_mut(&message.conversation_id) else {
            return Offer::NotSubscribed;
        };
        if let SubscriptionState::CatchingUp { pending } = &mut sub.state {
            if pending.len() >= self.max_pending {
                return Offer::Failed;
            }
            pending.push_back(Pending::Deleted(message.clone()));
            return Offer::Buffered;
        }
        match tombstone_outbound(sub, message) {
            Ok(Some(out)) => {
                if self.enqueue(out) {
                    Offer::Sent
                } else {
                    Offer::Failed
                }
            }
            Ok(None) => Offer::Duplicate,
            Err(_) => Offer::Failed,
        }
    }

    pub fn unsubscribe(&self, conversation: &ConversationId) -> bool {
        self.subscriptions.lock().remove(conversation).is_some()
    }

    pub fn is_subscribed(&self, conversation: &ConversationId) -> bool {
        self.subscriptions.lock().contains_key(conversation)
    }

    pub fn is_live(&self, conversation: &ConversationId) -> bool {
        matches!(
            self.subscriptions.lock().get(conversation).map(|s| &s.state),
            Some(SubscriptionState::Live)
        )
    }

    pub fn subscriptions(&self) -> Vec<ConversationId> {
        self.subscriptions.lock().keys().cloned().collect()
    }

    /// Highest seq handed to the writer for a conversation.
    pub fn last_pushed(&self, conversation: &ConversationId) -> Option<i64> {
        self.subscriptions.lock().get(conversation).map(|s| s.last_pushed)
    }

    /// Record client activity (any frame, ping or pong).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_activity.lock() = Instant::now();
    }

    /// Check and reset the alive flag.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Request the session to close. The first reason wins.
    pub fn close(&self, reason: CloseReason) {
        {
            let mut current = self.close_reason.lock();
            if current.is_none() {
                *current = Some(reason);
            }
        }
        self.cancel.cancel();
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

fn send_backlog(
    conversation: &ConversationId,
    sub: &mut Subscription,
    page: &[Message],
    complete: bool,
    permit: mpsc::Permit<'_, Outbound>,
) -> bool {
    let messages: Vec<WireMessage> = page
        .iter()
        .filter(|m| m.seq > sub.last_pushed)
        .map(WireMessage::from)
        .collect();
    let high = messages.last().map(|m| m.seq);
    let frame = ServerFrame::Backlog {
        conversation_id: conversation.clone(),
        messages,
        complete,
    };
    let Ok(json) = frame.to_json() else {
        return false;
    };
    permit.send(Outbound {
        frame: Arc::new(json),
        delivered: high.map(|seq| (conversation.clone(), seq)),
    });
    if let Some(seq) = high {
        sub.last_pushed = seq;
    }
    true
}

/// `None` when the message was already covered by an earlier push.
fn live_outbound(sub: &Subscription, message: &Message) -> Result<Option<Outbound>, serde_json::Error> {
    if message.seq <= sub.last_pushed {
        return Ok(None);
    }
    let json = ServerFrame::Message(WireMessage::from(message)).to_json()?;
    Ok(Some(Outbound {
        frame: Arc::new(json),
        delivered: Some((message.conversation_id.clone(), message.seq)),
    }))
}

/// `None` for messages sent before the user joined.
fn tombstone_outbound(sub: &Subscription, message: &Message) -> Result<Option<Outbound>, serde_json::Error> {
    if message.seq <= sub.floor {
        return Ok(None);
    }
    let json = ServerFrame::Deleted {
        conversation_id: message.conversation_id.clone(),
        message_id: message.id.clone(),
        seq: message.seq,
    }
    .to_json()?;
    Ok(Some(Outbound {
        frame: Arc::new(json),
        delivered: None,
    }))
}
