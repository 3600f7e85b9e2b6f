//! In-process store.

use crate::store::{
    now_millis, ChatMessage, Conversation, ConversationKind, ConversationStore, FriendRequest,
    FriendRequestStore, MessageDraft, MessageStore, ReadReceipt, RequestStatus, StoreError, User,
    UserStore,
};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
struct State {
    users: HashMap<String, User>,
    friendships: HashSet<(String, String)>,
    requests: Vec<FriendRequest>,
    conversations: Vec<Conversation>,
    messages: Vec<ChatMessage>,
    next_seq: u64,
}

impl State {
    fn request_mut(&mut self, id: &str) -> Option<&mut FriendRequest> {
        self.requests.iter_mut().find(|r| r.id == id)
    }
}

/// A [`crate::store::Store`] kept entirely in memory.
///
/// Useful for tests and single-node deployments without a database.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a user with a fixed id.
    pub async fn insert_user(&self, id: &str, name: &str) -> User {
        let user = User {
            id: id.to_string(),
            name: name.to_string(),
        };
        self.state
            .write()
            .await
            .users
            .insert(user.id.clone(), user.clone());
        user
    }

    /// Insert a conversation as-is.
    pub async fn insert_conversation(&self, conversation: Conversation) {
        self.state.write().await.conversations.push(conversation);
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn create_user(&self, name: &str) -> Result<User, StoreError> {
        let id = Uuid::new_v4().to_string();
        Ok(self.insert_user(&id, name).await)
    }

    async fn find_user(&self, id: &str) -> Result<Option<User>, StoreError> {
        Ok(self.state.read().await.users.get(id).cloned())
    }

    async fn add_friendship(&self, a: &str, b: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.friendships.insert((a.to_string(), b.to_string()));
        state.friendships.insert((b.to_string(), a.to_string()));
        Ok(())
    }

    async fn are_friends(&self, a: &str, b: &str) -> Result<bool, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .friendships
            .contains(&(a.to_string(), b.to_string())))
    }
}

#[async_trait]
impl FriendRequestStore for MemoryStore {
    async fn create_request(&self, from: &str, to: &str) -> Result<FriendRequest, StoreError> {
        let request = FriendRequest {
            id: Uuid::new_v4().to_string(),
            from: from.to_string(),
            to: to.to_string(),
            status: RequestStatus::Pending,
            created_at: now_millis(),
        };
        self.state.write().await.requests.push(request.clone());
        Ok(request)
    }

    async fn find_request(&self, id: &str) -> Result<Option<FriendRequest>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .requests
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn pending_between(
        &self,
        a: &str,
        b: &str,
    ) -> Result<Option<FriendRequest>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .requests
            .iter()
            .find(|r| {
                r.status == RequestStatus::Pending
                    && ((r.from == a && r.to == b) || (r.from == b && r.to == a))
            })
            .cloned())
    }

    async fn pending_for(&self, user: &str) -> Result<Vec<FriendRequest>, StoreError> {
        let state = self.state.read().await;
        let mut pending: Vec<FriendRequest> = state
            .requests
            .iter()
            .rev()
            .filter(|r| r.to == user && r.status == RequestStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(pending)
    }

    async fn resolve_request(
        &self,
        id: &str,
        status: RequestStatus,
    ) -> Result<FriendRequest, StoreError> {
        let mut state = self.state.write().await;
        let request = state
            .request_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("friend request {id}")))?;
        if request.status != RequestStatus::Pending {
            return Err(StoreError::Conflict(format!("friend request {id} already resolved")));
        }
        request.status = status;
        Ok(request.clone())
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn find_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .conversations
            .iter()
            .find(|c| c.id == id)
            .cloned())
    }

    async fn conversations_of(&self, user: &str) -> Result<Vec<Conversation>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .conversations
            .iter()
            .filter(|c| c.includes(user))
            .cloned()
            .collect())
    }

    async fn ensure_direct(
        &self,
        a: &str,
        b: &str,
        created_by: &str,
    ) -> Result<(Conversation, bool), StoreError> {
        let pair: BTreeSet<&str> = [a, b].into_iter().collect();

        let mut state = self.state.write().await;
        let existing = state.conversations.iter().find(|c| {
            c.kind == ConversationKind::Direct
                && c.participants.len() == 2
                && c.participants.iter().map(String::as_str).collect::<BTreeSet<_>>() == pair
        });
        if let Some(conversation) = existing {
            return Ok((conversation.clone(), false));
        }

        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            participants: vec![a.to_string(), b.to_string()],
            kind: ConversationKind::Direct,
            name: None,
            created_by: created_by.to_string(),
        };
        state.conversations.push(conversation.clone());
        debug!(conversation = %conversation.id, a = %a, b = %b, "Created direct conversation");
        Ok((conversation, true))
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn append(&self, draft: MessageDraft) -> Result<ChatMessage, StoreError> {
        let mut state = self.state.write().await;
        let sender = state
            .users
            .get(&draft.sender)
            .map(User::sender_info)
            .ok_or_else(|| StoreError::NotFound(format!("user {}", draft.sender)))?;

        state.next_seq += 1;
        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            conversation: draft.conversation,
            sender,
            content: draft.content,
            attachments: draft.attachments,
            read_by: Vec::new(),
            created_at: now_millis(),
            seq: state.next_seq,
        };
        state.messages.push(message.clone());
        Ok(message)
    }

    async fn messages_in(&self, conversation: &str) -> Result<Vec<ChatMessage>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .messages
            .iter()
            .filter(|m| m.conversation == conversation)
            .cloned()
            .collect())
    }

    async fn unread_for(
        &self,
        conversation: &str,
        user: &str,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .messages
            .iter()
            .rev()
            .filter(|m| m.conversation == conversation && m.is_unread_for(user))
            .cloned()
            .collect())
    }

    async fn mark_read(&self, conversation: &str, user: &str) -> Result<usize, StoreError> {
        let read_at = now_millis();
        let mut state = self.state.write().await;
        let mut marked = 0;
        for message in state
            .messages
            .iter_mut()
            .filter(|m| m.conversation == conversation && m.is_unread_for(user))
        {
            message.read_by.push(ReadReceipt {
                user: user.to_string(),
                read_at,
            });
            marked += 1;
        }
        Ok(marked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_request_only_once() {
        let store = MemoryStore::new();
        let request = store.create_request("a", "b").await.unwrap();

        store
            .resolve_request(&request.id, RequestStatus::Accepted)
            .await
            .unwrap();
        assert!(matches!(
            store.resolve_request(&request.id, RequestStatus::Rejected).await,
            Err(StoreError::Conflict(_))
        ));
        assert!(store.pending_for("b").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ensure_direct_reuses_either_order() {
        let store = MemoryStore::new();

        let (first, created) = store.ensure_direct("a", "b", "a").await.unwrap();
        assert!(created);
        let (second, created) = store.ensure_direct("b", "a", "b").await.unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_append_requires_known_sender() {
        let store = MemoryStore::new();
        let draft = MessageDraft {
            conversation: "c1".into(),
            sender: "ghost".into(),
            content: "hi".into(),
            attachments: Vec::new(),
        };
        assert!(matches!(
            store.append(draft).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unread_newest_first_and_mark_read() {
        let store = MemoryStore::new();
        store.insert_user("a", "Alice").await;
        store.insert_user("b", "Bob").await;

        for content in ["one", "two", "three"] {
            store
                .append(MessageDraft {
                    conversation: "c1".into(),
                    sender: "a".into(),
                    content: content.into(),
                    attachments: Vec::new(),
                })
                .await
                .unwrap();
        }

        let unread = store.unread_for("c1", "b").await.unwrap();
        assert_eq!(unread.len(), 3);
        assert_eq!(unread[0].content, "three");
        assert!(store.unread_for("c1", "a").await.unwrap().is_empty());

        assert_eq!(store.mark_read("c1", "b").await.unwrap(), 3);
        assert_eq!(store.mark_read("c1", "b").await.unwrap(), 0);
        assert!(store.unread_for("c1", "b").await.unwrap().is_empty());
    }
}
