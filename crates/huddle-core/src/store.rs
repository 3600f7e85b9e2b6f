//! Collaborator records and store traits.
//!
//! Persistence is owned by the surrounding application. The hub only needs
//! the narrow operations below; [`crate::memory::MemoryStore`] implements
//! them in process.

use async_trait::async_trait;
use huddle_protocol::{Attachment, ChatEnvelope, SenderInfo};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// A user identifier.
pub type UserId = String;

/// A conversation identifier.
pub type ConversationId = String;

/// Store errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The record changed under us.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The backing store could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Current time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
}

impl User {
    /// Sender summary for relayed messages.
    #[must_use]
    pub fn sender_info(&self) -> SenderInfo {
        SenderInfo {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendRequest {
    pub id: String,
    pub from: UserId,
    pub to: UserId,
    pub status: RequestStatus,
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Direct,
    Group,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub participants: Vec<UserId>,
    pub kind: ConversationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub created_by: UserId,
}

impl Conversation {
    /// Check whether `user` takes part in this conversation.
    #[must_use]
    pub fn includes(&self, user: &str) -> bool {
        self.participants.iter().any(|p| p == user)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub user: UserId,
    pub read_at: u64,
}

/// A persisted chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub conversation: ConversationId,
    pub sender: SenderInfo,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub read_by: Vec<ReadReceipt>,
    pub created_at: u64,
    /// Store-wide insertion sequence; breaks ties between equal timestamps.
    pub seq: u64,
}

impl ChatMessage {
    /// Check whether `user` has a read receipt on this message.
    #[must_use]
    pub fn is_read_by(&self, user: &str) -> bool {
        self.read_by.iter().any(|r| r.user == user)
    }

    /// A message is unread for `user` if someone else wrote it and `user`
    /// has no receipt on it.
    #[must_use]
    pub fn is_unread_for(&self, user: &str) -> bool {
        self.sender.id != user && !self.is_read_by(user)
    }

    /// The wire form relayed to viewing clients.
    #[must_use]
    pub fn envelope(&self) -> ChatEnvelope {
        ChatEnvelope {
            id: self.id.clone(),
            conversation: self.conversation.clone(),
            sender: self.sender.clone(),
            content: self.content.clone(),
            attachments: self.attachments.clone(),
            created_at: self.created_at,
        }
    }
}

/// A message about to be persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDraft {
    pub conversation: ConversationId,
    pub sender: UserId,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn create_user(&self, name: &str) -> Result<User, StoreError>;

    async fn find_user(&self, id: &str) -> Result<Option<User>, StoreError>;

    /// Record a friendship in both directions.
    async fn add_friendship(&self, a: &str, b: &str) -> Result<(), StoreError>;

    async fn are_friends(&self, a: &str, b: &str) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait FriendRequestStore: Send + Sync {
    async fn create_request(&self, from: &str, to: &str) -> Result<FriendRequest, StoreError>;

    async fn find_request(&self, id: &str) -> Result<Option<FriendRequest>, StoreError>;

    /// A pending request between `a` and `b`, in either direction.
    async fn pending_between(&self, a: &str, b: &str)
        -> Result<Option<FriendRequest>, StoreError>;

    /// Pending requests addressed to `user`, newest first.
    async fn pending_for(&self, user: &str) -> Result<Vec<FriendRequest>, StoreError>;

    /// Move a pending request to `status`.
    ///
    /// Fails with [`StoreError::Conflict`] if the request is no longer
    /// pending, so two concurrent resolutions cannot both succeed.
    async fn resolve_request(
        &self,
        id: &str,
        status: RequestStatus,
    ) -> Result<FriendRequest, StoreError>;
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn find_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError>;

    async fn conversations_of(&self, user: &str) -> Result<Vec<Conversation>, StoreError>;

    /// Return the direct conversation between `a` and `b`, creating it if
    /// none exists. The flag is `true` when it was created.
    async fn ensure_direct(
        &self,
        a: &str,
        b: &str,
        created_by: &str,
    ) -> Result<(Conversation, bool), StoreError>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message, resolving its sender.
    async fn append(&self, draft: MessageDraft) -> Result<ChatMessage, StoreError>;

    /// Messages in a conversation, oldest first.
    async fn messages_in(&self, conversation: &str) -> Result<Vec<ChatMessage>, StoreError>;

    /// Messages in a conversation that are unread for `user`, newest first.
    async fn unread_for(
        &self,
        conversation: &str,
        user: &str,
    ) -> Result<Vec<ChatMessage>, StoreError>;

    /// Add a read receipt for `user` on every message unread for them.
    /// Returns how many messages were marked.
    async fn mark_read(&self, conversation: &str, user: &str) -> Result<usize, StoreError>;
}

/// Everything the notification aggregator needs.
pub trait Store: UserStore + FriendRequestStore + ConversationStore + MessageStore {}

impl<T> Store for T where T: UserStore + FriendRequestStore + ConversationStore + MessageStore {}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(sender: &str) -> ChatMessage {
        ChatMessage {
            id: "m1".into(),
            conversation: "c1".into(),
            sender: SenderInfo {
                id: sender.into(),
                name: sender.to_uppercase(),
            },
            content: "hi".into(),
            attachments: Vec::new(),
            read_by: Vec::new(),
            created_at: 1,
            seq: 1,
        }
    }

    #[test]
    fn test_unread_excludes_own_and_read() {
        let mut msg = message("alice");
        assert!(!msg.is_unread_for("alice"));
        assert!(msg.is_unread_for("bob"));

        msg.read_by.push(ReadReceipt {
            user: "bob".into(),
            read_at: 2,
        });
        assert!(!msg.is_unread_for("bob"));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let value = serde_json::to_value(RequestStatus::Pending).unwrap();
        assert_eq!(value, "pending");
    }
}
