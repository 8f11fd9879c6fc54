//! Subscribe-time catch-up.
//!
//! The subscription is registered first, so live pushes that race the
//! history read are buffered on the session. Backlog pages are then read
//! until a short page shows the tail was reached; the final page flushes the
//! buffer and flips the subscription to live. Pages wait for queue space, so
//! a slow reader slows catch-up down rather than being disconnected.

use std::sync::Arc;

use tracing::{debug, instrument};

use parley_core::ids::ConversationId;
use parley_core::ChatError;

use crate::registry::ConnectionRegistry;
use crate::service::ChatService;

use super::connection::ConnectionSession;

/// Subscribe `session` to `conversation` and replay everything after
/// `after_seq`, or after the user's delivery cursor when absent. Group
/// history from before the user joined is never replayed.
#[instrument(skip_all, fields(session = %session.id, conversation_id = %conversation, after_seq))]
pub async fn subscribe_and_catch_up(
    service: &ChatService,
    registry: &ConnectionRegistry,
    session: &Arc<ConnectionSession>,
    conversation: &ConversationId,
    after_seq: Option<i64>,
) -> Result<(), ChatError> {
    let _ = service.ensure_member(conversation, &session.user_id).await?;
    let floor = service.join_floor(conversation, &session.user_id).await?;
    let start = match after_seq {
        Some(seq) => seq.max(0),
        None => service.cursor(&session.user_id, conversation).await?,
    }
    .max(floor);
    if !registry.subscribe(session, conversation, start, floor) {
        debug!("session closed before subscribing");
        return Ok(());
    }

    let page_size = service.config().backlog_page_size.max(1);
    let mut after = start;
    let mut pages = 0u32;
    loop {
        let page = match service.backlog_page(conversation, after, page_size).await {
            Ok(page) => page,
            Err(e) => {
                let _ = registry.unsubscribe(session, conversation);
                return Err(e);
            }
        };
        pages += 1;

        let full = page.len() >= page_size as usize;
        let queued = if full {
            session.push_backlog(conversation, &page).await
        } else {
            session.finish_catch_up(conversation, &page).await
        };
        if !queued {
            // Session closed, or withdrawn mid catch-up (membership revoked).
            let _ = registry.unsubscribe(session, conversation);
            debug!(pages, closed = session.is_closed(), "catch-up stopped");
            return Ok(());
        }
        if !full {
            debug!(pages, from = start, "catch-up complete");
            return Ok(());
        }
        if let Some(last) = page.last() {
            after = last.seq;
        }
    }
}
