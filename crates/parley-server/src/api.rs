//! REST surface under `/api`. Every route requires a bearer token; bodies
//! use the `{ success, ... }` envelope.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use tracing::{error, warn};

use parley_core::ids::{ConversationId, MessageId, UserId};
use parley_core::models::WireMessage;
use parley_core::rest::{
    AddMemberRequest, ChatPayload, ChatsPayload, ConversationsPayload, CreateGroupRequest, Envelope,
    ErrorBody, GroupPayload, GroupsPayload, HistoryQuery, MessagePayload, MessagesPayload,
    SendMessageRequest, StartDirectRequest, VerifyPayload,
};
use parley_core::ChatError;

use crate::server::AppState;

/// [`ChatError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub ChatError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0 {
            ChatError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ChatError::Forbidden(_) => StatusCode::FORBIDDEN,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::InvalidParticipants(_) | ChatError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ChatError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(ChatError::InvalidRequest(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self(ChatError::InvalidRequest(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }
        (status, Json(ErrorBody::from(&self.0))).into_response()
    }
}

type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

fn ok<T: serde::Serialize>(payload: T) -> ApiResult<T> {
    Ok(Json(Envelope::ok(payload)))
}

/// The caller, resolved from `Authorization: Bearer <token>`.
#[derive(Clone, Debug)]
pub struct AuthUser(pub UserId);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| ChatError::Unauthorized("missing bearer token".into()))?;
        let user = state.service.authenticate(token).await.map_err(|e| {
            warn!(error = %e, "rejected bearer token");
            e
        })?;
        Ok(Self(user))
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/auth/verify", get(verify))
        .route("/api/conversations", get(list_conversations))
        .route("/api/messages", post(send_message))
        .route("/api/messages/{id}", get(history).delete(delete_message))
        .route("/api/direct-chats", get(list_direct_chats).post(start_direct))
        .route("/api/groups", get(list_groups).post(create_group))
        .route("/api/groups/{id}/members", post(add_member))
        .route("/api/groups/{id}/members/{user_id}", delete(remove_member))
}

/// GET /api/auth/verify
async fn verify(AuthUser(user): AuthUser) -> ApiResult<VerifyPayload> {
    ok(VerifyPayload { user_id: user })
}

/// GET /api/conversations
async fn list_conversations(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> ApiResult<ConversationsPayload> {
    let conversations = state.service.conversations_for(&user).await?;
    ok(ConversationsPayload { conversations })
}

/// GET /api/messages/{conversationId}?after=&limit=
async fn history(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(conversation): Path<ConversationId>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> ApiResult<MessagesPayload> {
    let Query(query) = query?;
    let (messages, has_more) = state
        .service
        .history(&user, &conversation, query.after, query.limit)
        .await?;
    ok(MessagesPayload {
        messages: messages.iter().map(WireMessage::from).collect(),
        has_more,
    })
}

/// POST /api/messages
async fn send_message(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    body: Result<Json<SendMessageRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Envelope<MessagePayload>>), ApiError> {
    let Json(req) = body?;
    let message = state
        .service
        .send_message(&user, &req.conversation_id, &req.text, None)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(Envelope::ok(MessagePayload {
            message: WireMessage::from(&message),
        })),
    ))
}

/// DELETE /api/messages/{messageId}
async fn delete_message(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(message): Path<MessageId>,
) -> ApiResult<MessagePayload> {
    let tombstone = state.service.delete_message(&user, &message).await?;
    ok(MessagePayload {
        message: WireMessage::from(&tombstone),
    })
}

/// POST /api/direct-chats
async fn start_direct(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    body: Result<Json<StartDirectRequest>, JsonRejection>,
) -> ApiResult<ChatPayload> {
    let Json(req) = body?;
    let chat = state.service.start_direct(&user, &req.recipient_id).await?;
    ok(ChatPayload { chat })
}

/// GET /api/direct-chats
async fn list_direct_chats(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> ApiResult<ChatsPayload> {
    let chats = state.service.direct_chats_for(&user).await?;
    ok(ChatsPayload { chats })
}

/// POST /api/groups
async fn create_group(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    body: Result<Json<CreateGroupRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Envelope<GroupPayload>>), ApiError> {
    let Json(req) = body?;
    let group = state.service.create_group(&user, &req.name, &req.members).await?;
    Ok((StatusCode::CREATED, Json(Envelope::ok(GroupPayload { group }))))
}

/// GET /api/groups
async fn list_groups(State(state): State<AppState>, AuthUser(user): AuthUser) -> ApiResult<GroupsPayload> {
    let groups = state.service.groups_for(&user).await?;
    ok(GroupsPayload { groups })
}

/// POST /api/groups/{id}/members
async fn add_member(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(group): Path<ConversationId>,
    body: Result<Json<AddMemberRequest>, JsonRejection>,
) -> ApiResult<GroupPayload> {
    let Json(req) = body?;
    let group = state.service.add_member(&user, &group, &req.user_id).await?;
    ok(GroupPayload { group })
}

/// DELETE /api/groups/{id}/members/{userId}
async fn remove_member(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((group, member)): Path<(ConversationId, UserId)>,
) -> ApiResult<GroupPayload> {
    let group = state.service.remove_member(&user, &group, &member).await?;
    ok(GroupPayload { group })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        let cases = [
            (ChatError::Unauthorized(String::new()), StatusCode::UNAUTHORIZED),
            (ChatError::Forbidden(String::new()), StatusCode::FORBIDDEN),
            (ChatError::NotFound(String::new()), StatusCode::NOT_FOUND),
            (ChatError::InvalidParticipants(String::new()), StatusCode::BAD_REQUEST),
            (ChatError::InvalidRequest(String::new()), StatusCode::BAD_REQUEST),
            (ChatError::Transient(String::new()), StatusCode::SERVICE_UNAVAILABLE),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).status(), status);
        }
    }

    #[tokio::test]
    async fn error_response_body() {
        let resp = ApiError(ChatError::Forbidden("not a member".into())).into_response();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["success"], false);
        assert_eq!(parsed["code"], "FORBIDDEN");
        assert_eq!(parsed["error"], "not a member");
    }
}
