//! Channel-backed event sink.

use crate::traits::{EventSink, TransportError};
use huddle_protocol::ServerEvent;
use std::sync::Arc;
use tokio::sync::mpsc;

/// An [`EventSink`] backed by an unbounded mpsc channel.
///
/// The receiving half is drained by the task that owns the socket, which
/// keeps events from one sender in order for every recipient.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Arc<ServerEvent>>,
}

impl ChannelSink {
    /// Create a sink and the receiver its owner drains.
    #[must_use]
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<Arc<ServerEvent>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn deliver(&self, event: Arc<ServerEvent>) -> Result<(), TransportError> {
        self.tx
            .send(event)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_preserves_order() {
        let (sink, mut rx) = ChannelSink::pair();

        sink.deliver(Arc::new(ServerEvent::user_connected("abc", "p1")))
            .unwrap();
        sink.deliver(Arc::new(ServerEvent::user_disconnected("abc", "p1")))
            .unwrap();

        assert_eq!(
            *rx.recv().await.unwrap(),
            ServerEvent::user_connected("abc", "p1")
        );
        assert_eq!(
            *rx.recv().await.unwrap(),
            ServerEvent::user_disconnected("abc", "p1")
        );
    }

    #[test]
    fn test_channel_sink_closed_receiver() {
        let (sink, rx) = ChannelSink::pair();
        assert!(sink.is_open());

        drop(rx);

        assert!(!sink.is_open());
        assert!(matches!(
            sink.deliver(Arc::new(ServerEvent::Pong { timestamp: None })),
            Err(TransportError::ConnectionClosed)
        ));
    }
}
