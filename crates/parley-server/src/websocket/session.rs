//! Socket session lifecycle, from upgrade through disconnect.
//!
//! `Connecting -> Authenticated -> Subscribed/Live -> Closed`. The first
//! frame must be `auth`; everything after it is handled by the reader loop
//! while a writer task drains the session's outbound queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use parley_core::ids::UserId;
use parley_core::protocol::{ClientFrame, CloseReason, ServerFrame};
use parley_core::ChatError;

use crate::registry::ConnectionRegistry;
use crate::service::ChatService;

use super::connection::{ConnectionSession, Outbound};
use super::sync::subscribe_and_catch_up;

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// How long to wait for the writer to flush its close frame.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Run one socket connection to completion.
pub async fn run_ws_session(
    ws: WebSocket,
    service: Arc<ChatService>,
    registry: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let user_id = match authenticate(&mut ws_rx, &service, &shutdown).await {
        Ok(user_id) => user_id,
        Err(reason) => {
            debug!(%reason, "connection rejected before auth");
            let _ = send_close(&mut ws_tx, reason).await;
            return;
        }
    };

    let queue = service.config().max_send_queue;
    let (send_tx, send_rx) = mpsc::channel::<Outbound>(queue);
    let session = Arc::new(ConnectionSession::new(user_id, send_tx, queue));
    registry.register(session.clone());
    info!(session = %session.id, user_id = %session.user_id, "client connected");

    let _ = session.send_frame(&ServerFrame::Ready {
        session_id: session.id.clone(),
        user_id: session.user_id.clone(),
    });

    let writer = tokio::spawn(run_writer(ws_tx, send_rx, session.clone(), service.clone()));
    read_loop(&mut ws_rx, &session, &service, &registry).await;

    // Clean up
    let _ = registry.unregister(&session);
    if !session.is_closed() {
        session.close(CloseReason::TransportError);
    }
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        warn!(session = %session.id, "writer did not stop in time");
    }
    info!(
        session = %session.id,
        user_id = %session.user_id,
        reason = ?session.close_reason(),
        duration_secs = session.connected_at.elapsed().as_secs(),
        "client disconnected"
    );
}

/// Wait for the `auth` frame. Any other first frame, a bad token or the auth
/// timeout rejects the connection.
async fn authenticate(
    ws_rx: &mut WsStream,
    service: &ChatService,
    shutdown: &CancellationToken,
) -> Result<UserId, CloseReason> {
    let deadline = tokio::time::sleep(service.config().auth_timeout());
    tokio::pin!(deadline);

    loop {
        let msg = tokio::select! {
            msg = ws_rx.next() => msg,
            () = &mut deadline => return Err(CloseReason::Unauthorized),
            () = shutdown.cancelled() => return Err(CloseReason::ServerShutdown),
        };
        let text = match msg {
            Some(Ok(Message::Text(t))) => t.to_string(),
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => return Err(CloseReason::Unauthorized),
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_)) | Err(_)) | None => return Err(CloseReason::TransportError),
        };

        return match serde_json::from_str::<ClientFrame>(&text) {
            Ok(ClientFrame::Auth { token }) => service.authenticate(&token).await.map_err(|e| {
                debug!(error = %e, "auth failed");
                auth_close_reason(&e)
            }),
            Ok(other) => {
                debug!(kind = other.kind(), "frame before auth");
                Err(CloseReason::Unauthorized)
            }
            Err(_) => Err(CloseReason::Unauthorized),
        };
    }
}

/// A credential the identity store could not check yet is not a rejected
/// credential.
fn auth_close_reason(error: &ChatError) -> CloseReason {
    if error.is_retryable() {
        CloseReason::TransportError
    } else {
        CloseReason::Unauthorized
    }
}

async fn read_loop(
    ws_rx: &mut WsStream,
    session: &Arc<ConnectionSession>,
    service: &ChatService,
    registry: &ConnectionRegistry,
) {
    let cancel = session.cancel_token();
    loop {
        let msg = tokio::select! {
            msg = ws_rx.next() => msg,
            () = cancel.cancelled() => break,
        };
        let text = match msg {
            Some(Ok(Message::Text(t))) => t.to_string(),
            // Some clients send JSON as binary frames
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => {
                    session.mark_alive();
                    let _ = session.send_frame(&ServerFrame::error(&ChatError::InvalidRequest(
                        "binary frame is not UTF-8".into(),
                    )));
                    continue;
                }
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                session.mark_alive();
                continue;
            }
            Some(Ok(Message::Close(_))) | None => {
                debug!(session = %session.id, "client closed");
                break;
            }
            Some(Err(e)) => {
                debug!(session = %session.id, error = %e, "socket read failed");
                session.close(CloseReason::TransportError);
                break;
            }
        };
        session.mark_alive();

        let frame = match serde_json::from_str::<ClientFrame>(&text) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = session.send_frame(&ServerFrame::error(&ChatError::InvalidRequest(format!(
                    "malformed frame: {e}"
                ))));
                continue;
            }
        };
        if !handle_frame(frame, session, service, registry).await {
            break;
        }
    }
}

/// Handle one client frame. Returns `false` when the session should end.
#[instrument(skip_all, fields(session = %session.id, kind = frame.kind()))]
async fn handle_frame(
    frame: ClientFrame,
    session: &Arc<ConnectionSession>,
    service: &ChatService,
    registry: &ConnectionRegistry,
) -> bool {
    match frame {
        ClientFrame::Auth { .. } => {
            let _ = session.send_frame(&ServerFrame::error(&ChatError::InvalidRequest(
                "already authenticated".into(),
            )));
        }
        ClientFrame::Subscribe {
            conversation_id,
            after_seq,
        } => {
            if let Err(e) =
                subscribe_and_catch_up(service, registry, session, &conversation_id, after_seq).await
            {
                debug!(error = %e, conversation_id = %conversation_id, "subscribe failed");
                let _ = session.send_frame(&ServerFrame::error(&e));
            }
        }
        ClientFrame::Unsubscribe { conversation_id } => {
            let _ = registry.unsubscribe(session, &conversation_id);
        }
        ClientFrame::Send {
            conversation_id,
            text,
            client_msg_id,
        } => {
            let reply = match service
                .send_message(&session.user_id, &conversation_id, &text, Some(session.id.clone()))
                .await
            {
                Ok(message) => ServerFrame::Ack {
                    client_msg_id,
                    conversation_id,
                    message_id: message.id,
                    seq: message.seq,
                },
                Err(e) => ServerFrame::error(&e),
            };
            let _ = session.send_frame(&reply);
        }
        // Liveness is recorded for every frame.
        ClientFrame::Heartbeat => {}
        ClientFrame::Logout => {
            session.close(CloseReason::Logout);
            return false;
        }
    }
    true
}

/// Drain the outbound queue onto the socket, pinging on the heartbeat
/// interval. Advances the delivery cursor after each successful write that
/// carries a delivery marker.
async fn run_writer(
    mut ws_tx: WsSink,
    mut rx: mpsc::Receiver<Outbound>,
    session: Arc<ConnectionSession>,
    service: Arc<ChatService>,
) {
    let cancel = session.cancel_token();
    let mut ping_interval = tokio::time::interval(service.config().heartbeat_interval());
    // Skip the immediate first tick
    let _ = ping_interval.tick().await;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                // Flush what is already queued (errors, acks) before closing.
                while let Ok(out) = rx.try_recv() {
                    if write(&mut ws_tx, out, &session, &service).await.is_err() {
                        return;
                    }
                }
                let reason = session.close_reason().unwrap_or(CloseReason::ServerShutdown);
                let _ = send_close(&mut ws_tx, reason).await;
                return;
            }
            out = rx.recv() => match out {
                Some(out) => {
                    if write(&mut ws_tx, out, &session, &service).await.is_err() {
                        session.close(CloseReason::TransportError);
                        return;
                    }
                }
                None => return,
            },
            _ = ping_interval.tick() => {
                if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    session.close(CloseReason::TransportError);
                    return;
                }
            }
        }
    }
}

async fn write(
    ws_tx: &mut WsSink,
    out: Outbound,
    session: &ConnectionSession,
    service: &ChatService,
) -> Result<(), axum::Error> {
    let started = Instant::now();
    ws_tx.send(Message::Text(out.frame.as_str().to_owned().into())).await?;
    if let Some((conversation, seq)) = out.delivered {
        if let Err(e) = service.advance_cursor(&session.user_id, &conversation, seq).await {
            warn!(session = %session.id, conversation_id = %conversation, seq, error = %e, "cursor advance failed");
        }
    }
    tracing::trace!(session = %session.id, elapsed_us = started.elapsed().as_micros() as u64, "frame written");
    Ok(())
}

/// Send the `closed` frame followed by a close handshake.
async fn send_close(ws_tx: &mut WsSink, reason: CloseReason) -> Result<(), axum::Error> {
    if let Ok(json) = (ServerFrame::Closed { reason }).to_json() {
        ws_tx.send(Message::Text(json.into())).await?;
    }
    let code = match reason {
        CloseReason::Unauthorized => close_code::POLICY,
        CloseReason::ServerShutdown => close_code::AWAY,
        CloseReason::TransportError => close_code::ERROR,
        CloseReason::Logout | CloseReason::IdleTimeout => close_code::NORMAL,
    };
    ws_tx
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await
}
