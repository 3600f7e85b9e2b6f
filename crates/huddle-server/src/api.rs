//! HTTP routes for rooms, users, friend requests and chat.

use crate::error::ApiError;
use crate::handlers::AppState;
use crate::metrics;
use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use huddle_core::store::{ConversationId, UserStore};
use huddle_core::{ChatMessage, MessageDraft, Notifications, NotifyError, User};
use huddle_protocol::Attachment;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

/// Routes served next to the WebSocket endpoint.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/room", get(new_room))
        .route("/api/users", post(create_user))
        .route("/api/notifications/:user_id", get(notifications))
        .route("/api/add-friend", post(add_friend))
        .route("/api/accept-friend", post(accept_friend))
        .route("/api/reject-friend", post(reject_friend))
        .route("/mark-read/:conversation_id", post(mark_read))
        .route(
            "/api/conversations/:conversation_id/messages",
            get(history).post(send_message),
        )
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NewRoom {
    pub room: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateUser {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct AddFriend {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub request_id: String,
    pub user_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Accepted {
    pub conversation_id: ConversationId,
}

#[derive(Debug, Deserialize)]
pub struct MarkRead {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SendMessage {
    pub sender_id: String,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// Mint a fresh room identifier.
async fn new_room() -> Json<NewRoom> {
    Json(NewRoom {
        room: uuid::Uuid::new_v4().to_string(),
    })
}

async fn create_user(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateUser>,
) -> Result<Json<User>, ApiError> {
    let name = body.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("name cannot be empty".into()));
    }
    let user = state.store.create_user(name).await?;
    info!(user = %user.id, "Registered user");
    Ok(Json(user))
}

/// Fail with 404 unless `user_id` names a registered user.
async fn require_user(state: &AppState, user_id: &str) -> Result<(), ApiError> {
    match state.store.find_user(user_id).await? {
        Some(_) => Ok(()),
        None => Err(NotifyError::UserNotFound(user_id.to_string()).into()),
    }
}

async fn notifications(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<Notifications>, ApiError> {
    require_user(&state, &user_id).await?;
    Ok(Json(state.notifications.compute_for(&user_id).await?))
}

async fn add_friend(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AddFriend>,
) -> Result<Json<Value>, ApiError> {
    let request = state.notifications.send_request(&body.from, &body.to).await?;
    Ok(Json(json!({ "success": true, "request_id": request.id })))
}

async fn accept_friend(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ResolveRequest>,
) -> Result<Json<Accepted>, ApiError> {
    let conversation_id = state
        .notifications
        .accept_request(&body.request_id, &body.user_id)
        .await?;
    Ok(Json(Accepted { conversation_id }))
}

async fn reject_friend(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ResolveRequest>,
) -> Result<Json<Value>, ApiError> {
    state
        .notifications
        .reject_request(&body.request_id, &body.user_id)
        .await?;
    Ok(Json(json!({ "success": true })))
}

async fn mark_read(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    Json(body): Json<MarkRead>,
) -> Result<Json<Value>, ApiError> {
    require_user(&state, &body.user_id).await?;
    let marked = state
        .notifications
        .mark_read(&conversation_id, &body.user_id)
        .await?;
    Ok(Json(json!({ "success": true, "marked": marked })))
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    Json(body): Json<SendMessage>,
) -> Result<Json<ChatMessage>, ApiError> {
    let draft = MessageDraft {
        conversation: conversation_id,
        sender: body.sender_id,
        content: body.content,
        attachments: body.attachments,
    };
    let (message, delivery) = state.chat.send(draft, None).await?;
    metrics::record_chat_message();
    metrics::record_delivery(delivery);
    Ok(Json(message))
}

async fn history(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    Ok(Json(state.chat.history(&conversation_id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::http::StatusCode;
    use huddle_protocol::{ClientEvent, ServerEvent};
    use huddle_transport::{ChannelSink, ConnectionId};

    fn state() -> Arc<AppState> {
        Arc::new(AppState::new(Config::default()))
    }

    async fn user(state: &Arc<AppState>, name: &str) -> User {
        create_user(
            State(state.clone()),
            Json(CreateUser { name: name.into() }),
        )
        .await
        .unwrap()
        .0
    }

    #[tokio::test]
    async fn test_new_room_is_unique() {
        let a = new_room().await.0.room;
        let b = new_room().await.0.room;
        assert_ne!(a, b);
        assert!(uuid::Uuid::parse_str(&a).is_ok());
    }

    #[tokio::test]
    async fn test_blank_user_name_rejected() {
        let err = create_user(State(state()), Json(CreateUser { name: "  ".into() }))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_friend_request_flow() {
        let state = state();
        let alice = user(&state, "Alice").await;
        let bob = user(&state, "Bob").await;

        let response = add_friend(
            State(state.clone()),
            Json(AddFriend {
                from: alice.id.clone(),
                to: bob.id.clone(),
            }),
        )
        .await
        .unwrap()
        .0;
        let request_id = response["request_id"].as_str().unwrap().to_string();

        let pending = notifications(State(state.clone()), Path(bob.id.clone()))
            .await
            .unwrap()
            .0;
        assert_eq!(pending.friend_requests.len(), 1);
        assert_eq!(pending.total, 1);

        // Only the recipient may accept
        let err = accept_friend(
            State(state.clone()),
            Json(ResolveRequest {
                request_id: request_id.clone(),
                user_id: alice.id.clone(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);

        let accepted = accept_friend(
            State(state.clone()),
            Json(ResolveRequest {
                request_id: request_id.clone(),
                user_id: bob.id.clone(),
            }),
        )
        .await
        .unwrap()
        .0;
        assert!(!accepted.conversation_id.is_empty());

        let err = reject_friend(
            State(state.clone()),
            Json(ResolveRequest {
                request_id,
                user_id: bob.id.clone(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::CONFLICT);

        let after = notifications(State(state), Path(bob.id)).await.unwrap().0;
        assert_eq!(after.total, 0);
    }

    #[tokio::test]
    async fn test_message_relayed_and_marked_read() {
        let state = state();
        let alice = user(&state, "Alice").await;
        let bob = user(&state, "Bob").await;

        let request = state
            .notifications
            .send_request(&alice.id, &bob.id)
            .await
            .unwrap();
        let conversation = state
            .notifications
            .accept_request(&request.id, &bob.id)
            .await
            .unwrap();

        // Bob views the conversation over a socket
        let viewer = ConnectionId::new("viewer");
        let (sink, mut rx) = ChannelSink::pair();
        state.relay.attach(viewer.clone(), Arc::new(sink));
        state
            .relay
            .handle(&viewer, ClientEvent::subscribe(conversation.clone(), bob.id.clone()))
            .unwrap();

        let sent = send_message(
            State(state.clone()),
            Path(conversation.clone()),
            Json(SendMessage {
                sender_id: alice.id.clone(),
                content: "hello bob".into(),
                attachments: Vec::new(),
            }),
        )
        .await
        .unwrap()
        .0;

        match rx.try_recv().unwrap().as_ref() {
            ServerEvent::NewMessage { room, message } => {
                assert_eq!(room, &conversation);
                assert_eq!(message.id, sent.id);
            }
            other => panic!("unexpected event {other:?}"),
        }

        let unread = notifications(State(state.clone()), Path(bob.id.clone()))
            .await
            .unwrap()
            .0;
        assert_eq!(unread.messages.len(), 1);
        assert_eq!(unread.messages[0].preview, "hello bob");

        let marked = mark_read(
            State(state.clone()),
            Path(conversation.clone()),
            Json(MarkRead {
                user_id: bob.id.clone(),
            }),
        )
        .await
        .unwrap()
        .0;
        assert_eq!(marked["marked"], 1);

        let history = history(State(state), Path(conversation)).await.unwrap().0;
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_user_not_found() {
        let state = state();

        let err = notifications(State(state.clone()), Path("ghost".into()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        let err = mark_read(
            State(state),
            Path("c1".into()),
            Json(MarkRead {
                user_id: "ghost".into(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_empty_message_rejected() {
        let state = state();
        let err = send_message(
            State(state),
            Path("c1".into()),
            Json(SendMessage {
                sender_id: "u1".into(),
                content: "   ".into(),
                attachments: Vec::new(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
