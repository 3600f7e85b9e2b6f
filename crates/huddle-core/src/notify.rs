//! Notification aggregation.
//!
//! Notifications are never stored. Every call to
//! [`NotificationAggregator::compute_for`] derives them from pending friend
//! requests and unread conversation messages, so the mutating operations
//! here only have to change those underlying records.

use crate::relay::Relay;
use crate::store::{
    ConversationId, ConversationKind, FriendRequest, RequestStatus, Store, StoreError,
};
use huddle_protocol::{SenderInfo, ServerEvent};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Maximum characters of a message shown in a notification.
pub const PREVIEW_LENGTH: usize = 50;

/// Notification errors.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Friend request not found: {0}")]
    RequestNotFound(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    /// The acting user is not the recipient of the request.
    #[error("Not authorized to resolve this request")]
    NotAuthorized,

    #[error("Friend request already resolved")]
    AlreadyResolved,

    #[error("Cannot send a friend request to yourself")]
    SelfRequest,

    #[error("Already friends")]
    AlreadyFriends,

    #[error("A friend request between these users is already pending")]
    RequestPending,
}

/// A pending friend request addressed to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FriendRequestNotice {
    pub id: String,
    pub from: SenderInfo,
    pub message: String,
    pub created_at: u64,
}

/// The latest unread message of one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageNotice {
    /// Id of the latest unread message.
    pub id: String,
    pub from: SenderInfo,
    pub preview: String,
    pub created_at: u64,
    pub unread_count: usize,
    pub conversation_id: ConversationId,
    pub conversation_kind: ConversationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_name: Option<String>,
    #[serde(skip)]
    seq: u64,
}

/// Everything that needs the user's attention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notifications {
    pub friend_requests: Vec<FriendRequestNotice>,
    pub messages: Vec<MessageNotice>,
    pub total: usize,
}

/// Truncate a message body for display.
#[must_use]
pub fn preview(content: &str) -> String {
    match content.char_indices().nth(PREVIEW_LENGTH) {
        Some((end, _)) => format!("{}...", &content[..end]),
        None => content.to_string(),
    }
}

/// Computes notifications and applies the operations that resolve them.
pub struct NotificationAggregator {
    store: Arc<dyn Store>,
    relay: Option<Arc<Relay>>,
}

impl NotificationAggregator {
    /// Create an aggregator without live pushes.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store, relay: None }
    }

    /// Push new friend requests to the recipient's personal room.
    #[must_use]
    pub fn with_relay(mut self, relay: Arc<Relay>) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Compute the notifications of `user`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn compute_for(&self, user: &str) -> Result<Notifications, NotifyError> {
        let mut friend_requests = Vec::new();
        for request in self.store.pending_for(user).await? {
            let Some(sender) = self.store.find_user(&request.from).await? else {
                debug!(request = %request.id, from = %request.from, "Skipping request from unknown user");
                continue;
            };
            friend_requests.push(FriendRequestNotice {
                message: format!("{} sent you a friend request", sender.name),
                id: request.id,
                from: sender.sender_info(),
                created_at: request.created_at,
            });
        }

        let mut messages = Vec::new();
        for conversation in self.store.conversations_of(user).await? {
            let unread = self.store.unread_for(&conversation.id, user).await?;
            let Some(latest) = unread.first() else {
                continue;
            };
            messages.push(MessageNotice {
                id: latest.id.clone(),
                from: latest.sender.clone(),
                preview: preview(&latest.content),
                created_at: latest.created_at,
                unread_count: unread.len(),
                conversation_id: conversation.id,
                conversation_kind: conversation.kind,
                conversation_name: conversation.name,
                seq: latest.seq,
            });
        }
        messages.sort_by(|a, b| (b.created_at, b.seq).cmp(&(a.created_at, a.seq)));

        let total = friend_requests.len() + messages.len();
        Ok(Notifications {
            friend_requests,
            messages,
            total,
        })
    }

    /// Send a friend request from `from` to `to`.
    ///
    /// # Errors
    ///
    /// Fails if the users are the same, either is unknown, they are already
    /// friends, or a request between them is pending in either direction.
    pub async fn send_request(&self, from: &str, to: &str) -> Result<FriendRequest, NotifyError> {
        if from == to {
            return Err(NotifyError::SelfRequest);
        }
        let sender = self
            .store
            .find_user(from)
            .await?
            .ok_or_else(|| NotifyError::UserNotFound(from.to_string()))?;
        if self.store.find_user(to).await?.is_none() {
            return Err(NotifyError::UserNotFound(to.to_string()));
        }
        if self.store.are_friends(from, to).await? {
            return Err(NotifyError::AlreadyFriends);
        }
        if self.store.pending_between(from, to).await?.is_some() {
            return Err(NotifyError::RequestPending);
        }

        let request = self.store.create_request(from, to).await?;
        info!(request = %request.id, from = %from, to = %to, "Friend request sent");

        if let Some(relay) = &self.relay {
            relay.send_to_room(
                to,
                ServerEvent::FriendRequestReceived {
                    request_id: request.id.clone(),
                    from: sender.id,
                    from_name: sender.name,
                },
            );
        }
        Ok(request)
    }

    /// Accept a request addressed to `acting_user`.
    ///
    /// Records the friendship in both directions and returns the direct
    /// conversation between the two users, created only if missing.
    ///
    /// # Errors
    ///
    /// Fails if the request is unknown, addressed to someone else, or no
    /// longer pending.
    pub async fn accept_request(
        &self,
        request_id: &str,
        acting_user: &str,
    ) -> Result<ConversationId, NotifyError> {
        let request = self.resolve(request_id, acting_user, RequestStatus::Accepted).await?;

        self.store.add_friendship(&request.from, &request.to).await?;
        let (conversation, created) = self
            .store
            .ensure_direct(&request.from, &request.to, acting_user)
            .await?;

        info!(
            request = %request.id,
            conversation = %conversation.id,
            created,
            "Friend request accepted"
        );
        Ok(conversation.id)
    }

    /// Reject a request addressed to `acting_user`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::accept_request`].
    pub async fn reject_request(
        &self,
        request_id: &str,
        acting_user: &str,
    ) -> Result<(), NotifyError> {
        let request = self.resolve(request_id, acting_user, RequestStatus::Rejected).await?;
        info!(request = %request.id, "Friend request rejected");
        Ok(())
    }

    /// Mark every message of `conversation` as read by `user`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn mark_read(&self, conversation: &str, user: &str) -> Result<usize, NotifyError> {
        let marked = self.store.mark_read(conversation, user).await?;
        debug!(conversation = %conversation, user = %user, marked, "Marked read");
        Ok(marked)
    }

    async fn resolve(
        &self,
        request_id: &str,
        acting_user: &str,
        status: RequestStatus,
    ) -> Result<FriendRequest, NotifyError> {
        let request = self
            .store
            .find_request(request_id)
            .await?
            .ok_or_else(|| NotifyError::RequestNotFound(request_id.to_string()))?;

        if request.to != acting_user {
            return Err(NotifyError::NotAuthorized);
        }
        if request.status != RequestStatus::Pending {
            return Err(NotifyError::AlreadyResolved);
        }

        match self.store.resolve_request(request_id, status).await {
            Ok(request) => Ok(request),
            Err(StoreError::Conflict(_)) => Err(NotifyError::AlreadyResolved),
            Err(e) => Err(e.into()),
        }
    }
}
