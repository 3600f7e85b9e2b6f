//! Live chat fan-out.
//!
//! A message is persisted first and only then relayed as `new-message` to
//! the connections viewing its conversation. Sends to the same conversation
//! are serialized, so viewers see messages in persisted order.

use crate::registry::RoomId;
use crate::relay::{Delivery, Relay};
use crate::store::{ChatMessage, MessageDraft, MessageStore, StoreError};
use dashmap::DashMap;
use huddle_protocol::ServerEvent;
use huddle_transport::ConnectionId;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Fan-out errors.
#[derive(Debug, Error)]
pub enum FanoutError {
    /// Persisting the message failed; nothing was relayed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The message has neither content nor attachments.
    #[error("Message is empty")]
    EmptyMessage,
}

/// Persists chat messages and relays them to viewers.
pub struct ChatFanout {
    store: Arc<dyn MessageStore>,
    relay: Arc<Relay>,
    order: DashMap<RoomId, Arc<Mutex<()>>>,
}

impl ChatFanout {
    /// Create a fan-out over a message store and relay.
    #[must_use]
    pub fn new(store: Arc<dyn MessageStore>, relay: Arc<Relay>) -> Self {
        Self {
            store,
            relay,
            order: DashMap::new(),
        }
    }

    /// Persist `draft` and relay it to the conversation's room.
    ///
    /// The connection in `origin`, if any, does not receive the relay; the
    /// sender already has the message from the return value.
    ///
    /// # Errors
    ///
    /// Returns an error if the message is empty or could not be persisted.
    /// In both cases no event is relayed.
    pub async fn send(
        &self,
        draft: MessageDraft,
        origin: Option<&ConnectionId>,
    ) -> Result<(ChatMessage, Delivery), FanoutError> {
        if draft.content.trim().is_empty() && draft.attachments.is_empty() {
            return Err(FanoutError::EmptyMessage);
        }

        let room = draft.conversation.clone();
        let lock = Arc::clone(self.order.entry(room.clone()).or_default().value());

        let result = {
            let _guard = lock.lock().await;
            match self.store.append(draft).await {
                Ok(message) => {
                    let delivery = self.relay.broadcast(
                        &room,
                        origin,
                        ServerEvent::NewMessage {
                            room: room.clone(),
                            message: message.envelope(),
                        },
                    );
                    debug!(
                        room = %room,
                        message = %message.id,
                        delivered = delivery.delivered,
                        "Relayed chat message"
                    );
                    Ok((message, delivery))
                }
                Err(e) => {
                    warn!(room = %room, error = %e, "Failed to persist chat message");
                    Err(e.into())
                }
            }
        };

        drop(lock);
        self.order
            .remove_if(&room, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// Messages of a conversation, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn history(&self, conversation: &str) -> Result<Vec<ChatMessage>, FanoutError> {
        Ok(self.store.messages_in(conversation).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::registry::RoomRegistry;
    use async_trait::async_trait;
    use huddle_protocol::ClientEvent;
    use huddle_transport::ChannelSink;

    struct Unavailable;

    #[async_trait]
    impl MessageStore for Unavailable {
        async fn append(&self, _draft: MessageDraft) -> Result<ChatMessage, StoreError> {
            Err(StoreError::Unavailable("database offline".into()))
        }

        async fn messages_in(&self, _conversation: &str) -> Result<Vec<ChatMessage>, StoreError> {
            Ok(Vec::new())
        }

        async fn unread_for(
            &self,
            _conversation: &str,
            _user: &str,
        ) -> Result<Vec<ChatMessage>, StoreError> {
            Ok(Vec::new())
        }

        async fn mark_read(&self, _conversation: &str, _user: &str) -> Result<usize, StoreError> {
            Ok(0)
        }
    }

    fn draft(content: &str) -> MessageDraft {
        MessageDraft {
            conversation: "conv".into(),
            sender: "a".into(),
            content: content.into(),
            attachments: Vec::new(),
        }
    }

    fn relay_with_viewers() -> (
        Arc<Relay>,
        ConnectionId,
        tokio::sync::mpsc::UnboundedReceiver<Arc<ServerEvent>>,
        tokio::sync::mpsc::UnboundedReceiver<Arc<ServerEvent>>,
    ) {
        let relay = Arc::new(Relay::new(Arc::new(RoomRegistry::new())));
        let (sink_a, rx_a) = ChannelSink::pair();
        let (sink_b, rx_b) = ChannelSink::pair();
        let (ca, cb) = (ConnectionId::new("ca"), ConnectionId::new("cb"));
        relay.attach(ca.clone(), Arc::new(sink_a));
        relay.attach(cb.clone(), Arc::new(sink_b));
        relay.handle(&ca, ClientEvent::subscribe("conv", "a")).unwrap();
        relay.handle(&cb, ClientEvent::subscribe("conv", "b")).unwrap();
        (relay, ca, rx_a, rx_b)
    }

    #[tokio::test]
    async fn test_persist_then_relay() {
        let store = Arc::new(MemoryStore::new());
        store.insert_user("a", "Alice").await;
        let (relay, ca, mut rx_a, mut rx_b) = relay_with_viewers();
        let fanout = ChatFanout::new(store, relay);

        let (message, delivery) = fanout.send(draft("hello"), Some(&ca)).await.unwrap();
        assert_eq!(delivery.delivered, 1);
        assert!(rx_a.try_recv().is_err());

        match &*rx_b.try_recv().unwrap() {
            ServerEvent::NewMessage { room, message: relayed } => {
                assert_eq!(room, "conv");
                assert_eq!(relayed, &message.envelope());
                assert_eq!(relayed.sender.name, "Alice");
            }
            other => panic!("Expected new-message, got {:?}", other),
        }
        assert_eq!(fanout.history("conv").await.unwrap(), vec![message]);
    }

    #[tokio::test]
    async fn test_failed_persist_relays_nothing() {
        let (relay, _ca, _rx_a, mut rx_b) = relay_with_viewers();
        let fanout = ChatFanout::new(Arc::new(Unavailable), relay);

        assert!(matches!(
            fanout.send(draft("hello"), None).await,
            Err(FanoutError::Store(StoreError::Unavailable(_)))
        ));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_empty_message_rejected() {
        let (relay, _ca, _rx_a, _rx_b) = relay_with_viewers();
        let fanout = ChatFanout::new(Arc::new(MemoryStore::new()), relay);

        assert!(matches!(
            fanout.send(draft("   "), None).await,
            Err(FanoutError::EmptyMessage)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sends_relay_in_persisted_order() {
        let store = Arc::new(MemoryStore::new());
        store.insert_user("a", "Alice").await;
        let (relay, _ca, _rx_a, mut rx_b) = relay_with_viewers();
        let fanout = Arc::new(ChatFanout::new(store, relay));

        let mut tasks = Vec::new();
        for i in 0..20 {
            let fanout = Arc::clone(&fanout);
            tasks.push(tokio::spawn(async move {
                fanout.send(draft(&format!("m{i}")), None).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let persisted: Vec<String> = fanout
            .history("conv")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        let mut relayed = Vec::new();
        while let Ok(event) = rx_b.try_recv() {
            if let ServerEvent::NewMessage { message, .. } = &*event {
                relayed.push(message.id.clone());
            }
        }
        assert_eq!(relayed, persisted);
        assert!(fanout.order.is_empty());
    }
}
