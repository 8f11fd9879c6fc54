//! REST request and response bodies.
//!
//! Responses use the `{ success, ...payload }` / `{ success: false, error, code }`
//! envelope the rest of the application already speaks.

use serde::{Deserialize, Serialize};

use crate::errors::ChatError;
use crate::ids::{ConversationId, UserId};
use crate::models::{Conversation, ConversationSummary, Group, WireMessage};

/// Success envelope: `success: true` next to the flattened payload.
#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub success: bool,
    #[serde(flatten)]
    pub payload: T,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(payload: T) -> Self {
        Self {
            success: true,
            payload,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
    pub code: &'static str,
}

impl From<&ChatError> for ErrorBody {
    fn from(err: &ChatError) -> Self {
        Self {
            success: false,
            error: err.detail().to_string(),
            code: err.code(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub conversation_id: ConversationId,
    pub text: String,
    #[serde(default)]
    pub client_msg_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartDirectRequest {
    pub recipient_id: UserId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupRequest {
    pub name: String,
    #[serde(default)]
    pub members: Vec<UserId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddMemberRequest {
    pub user_id: UserId,
}

/// `?after=&limit=` on the history route.
#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub after: Option<i64>,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct ConversationsPayload {
    pub conversations: Vec<ConversationSummary>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesPayload {
    pub messages: Vec<WireMessage>,
    pub has_more: bool,
}

#[derive(Debug, Serialize)]
pub struct MessagePayload {
    pub message: WireMessage,
}

/// Body of `POST /api/direct-chats`: the new or existing direct conversation.
#[derive(Debug, Serialize)]
pub struct ChatPayload {
    pub chat: Conversation,
}

#[derive(Debug, Serialize)]
pub struct ChatsPayload {
    pub chats: Vec<ConversationSummary>,
}

#[derive(Debug, Serialize)]
pub struct GroupPayload {
    pub group: Group,
}

#[derive(Debug, Serialize)]
pub struct GroupsPayload {
    pub groups: Vec<Group>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyPayload {
    pub user_id: UserId,
}
