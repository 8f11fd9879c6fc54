//! Socket frames. Every frame is a JSON object with a snake_case `type` tag
//! and camelCase fields.

use serde::{Deserialize, Serialize};

use crate::errors::ChatError;
use crate::ids::{ConnectionId, ConversationId, MessageId, UserId};
use crate::models::WireMessage;

/// Client → server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    Auth {
        token: String,
    },
    Subscribe {
        conversation_id: ConversationId,
        /// Highest seq the client already holds. Falls back to the durable
        /// delivery cursor when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after_seq: Option<i64>,
    },
    Unsubscribe {
        conversation_id: ConversationId,
    },
    Send {
        conversation_id: ConversationId,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_msg_id: Option<String>,
    },
    Heartbeat,
    Logout,
}

impl ClientFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::Send { .. } => "send",
            Self::Heartbeat => "heartbeat",
            Self::Logout => "logout",
        }
    }
}

/// Why the server closed a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Unauthorized,
    Logout,
    IdleTimeout,
    ServerShutdown,
    TransportError,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unauthorized => "unauthorized",
            Self::Logout => "logout",
            Self::IdleTimeout => "idle_timeout",
            Self::ServerShutdown => "server_shutdown",
            Self::TransportError => "transport_error",
        };
        f.write_str(s)
    }
}

/// Server → client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    Ready {
        session_id: ConnectionId,
        user_id: UserId,
    },
    Backlog {
        conversation_id: ConversationId,
        messages: Vec<WireMessage>,
        /// Set on the last backlog page; live pushes follow.
        complete: bool,
    },
    Message(WireMessage),
    Deleted {
        conversation_id: ConversationId,
        message_id: MessageId,
        seq: i64,
    },
    Ack {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_msg_id: Option<String>,
        conversation_id: ConversationId,
        message_id: MessageId,
        seq: i64,
    },
    Error {
        code: String,
        detail: String,
    },
    Closed {
        reason: CloseReason,
    },
}

impl ServerFrame {
    pub fn error(err: &ChatError) -> Self {
        Self::Error {
            code: err.code().to_string(),
            detail: err.detail().to_string(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
