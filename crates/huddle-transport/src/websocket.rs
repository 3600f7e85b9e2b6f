//! Reconnecting WebSocket client.
//!
//! The client keeps track of every room it considers itself a member of.
//! When the connection drops it retries at a fixed interval and, once
//! reconnected, re-sends `join-room` / `subscribe` for each of those rooms
//! before anything else.

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use huddle_protocol::{codec, ClientEvent, ServerEvent, WireFormat};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::traits::TransportError;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server WebSocket URL, e.g. `ws://127.0.0.1:8080/ws`.
    pub url: String,
    /// Fixed delay between reconnection attempts.
    pub retry_interval: Duration,
    /// Give up after this many consecutive failed attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Wire format to speak.
    pub format: WireFormat,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".to_string(),
            retry_interval: Duration::from_secs(3),
            max_attempts: None,
            format: WireFormat::Json,
        }
    }
}

impl ClientConfig {
    /// The URL to dial, including the format query parameter when needed.
    #[must_use]
    pub fn dial_url(&self) -> String {
        match self.format {
            WireFormat::Json => self.url.clone(),
            WireFormat::MessagePack => {
                let sep = if self.url.contains('?') { '&' } else { '?' };
                format!("{}{}format={}", self.url, sep, self.format.name())
            }
        }
    }
}

/// How a room was joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinMode {
    Announced,
    Silent,
}

/// Rooms the client considers itself a member of.
#[derive(Debug, Default)]
pub struct Memberships {
    rooms: BTreeMap<(String, String), JoinMode>,
}

impl Memberships {
    /// Create an empty membership set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the set from an outbound event.
    pub fn record(&mut self, event: &ClientEvent) {
        match event {
            ClientEvent::JoinRoom { room, participant } => {
                self.rooms
                    .insert((room.clone(), participant.clone()), JoinMode::Announced);
            }
            ClientEvent::Subscribe { room, participant } => {
                self.rooms
                    .entry((room.clone(), participant.clone()))
                    .or_insert(JoinMode::Silent);
            }
            ClientEvent::LeaveRoom { room, participant }
            | ClientEvent::Unsubscribe { room, participant } => {
                self.rooms.remove(&(room.clone(), participant.clone()));
            }
            _ => {}
        }
    }

    /// Events that restore every membership on a fresh connection.
    #[must_use]
    pub fn rejoin_events(&self) -> Vec<ClientEvent> {
        self.rooms
            .iter()
            .map(|((room, participant), mode)| match mode {
                JoinMode::Announced => ClientEvent::join_room(room, participant),
                JoinMode::Silent => ClientEvent::subscribe(room, participant),
            })
            .collect()
    }

    /// Number of tracked memberships.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    /// Check if no memberships are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

/// Notices emitted by the client to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientNotice {
    /// An event arrived from the server.
    Event(ServerEvent),
    /// A connection was (re)established; `attempt` counts reconnections.
    Connected { attempt: u32 },
    /// The connection dropped; a retry follows.
    Disconnected,
    /// Retries were exhausted.
    GaveUp,
}

/// Handle to a running client.
#[derive(Clone)]
pub struct SignalClient {
    outbound: mpsc::UnboundedSender<ClientEvent>,
    memberships: Arc<Mutex<Memberships>>,
}

impl SignalClient {
    /// Spawn the client task.
    ///
    /// Returns the handle and the stream of notices.
    #[must_use]
    pub fn spawn(
        config: ClientConfig,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<ClientNotice>,
        JoinHandle<()>,
    ) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let memberships = Arc::new(Mutex::new(Memberships::new()));

        let task = tokio::spawn(run(
            config,
            outbound_rx,
            notice_tx,
            Arc::clone(&memberships),
        ));

        (
            Self {
                outbound: outbound_tx,
                memberships,
            },
            notice_rx,
            task,
        )
    }

    /// Send an event, recording membership changes.
    ///
    /// # Errors
    ///
    /// Returns an error if the client task has stopped.
    pub fn send(&self, event: ClientEvent) -> Result<(), TransportError> {
        if let Ok(mut memberships) = self.memberships.lock() {
            memberships.record(&event);
        }
        self.outbound
            .send(event)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Join a room with presence announcement.
    ///
    /// # Errors
    ///
    /// Returns an error if the client task has stopped.
    pub fn join_room(&self, room: &str, participant: &str) -> Result<(), TransportError> {
        self.send(ClientEvent::join_room(room, participant))
    }

    /// Leave a room.
    ///
    /// # Errors
    ///
    /// Returns an error if the client task has stopped.
    pub fn leave_room(&self, room: &str, participant: &str) -> Result<(), TransportError> {
        self.send(ClientEvent::leave_room(room, participant))
    }

    /// Number of rooms that will be rejoined after a reconnect.
    #[must_use]
    pub fn membership_count(&self) -> usize {
        self.memberships.lock().map(|m| m.len()).unwrap_or(0)
    }
}

async fn run(
    config: ClientConfig,
    mut outbound: mpsc::UnboundedReceiver<ClientEvent>,
    notices: mpsc::UnboundedSender<ClientNotice>,
    memberships: Arc<Mutex<Memberships>>,
) {
    let url = config.dial_url();
    let mut failures = 0u32;
    let mut connections = 0u32;

    loop {
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                failures = 0;
                let rejoin = memberships
                    .lock()
                    .map(|m| m.rejoin_events())
                    .unwrap_or_default();

                info!(url = %url, attempt = connections, rooms = rejoin.len(), "Signaling connected");
                let _ = notices.send(ClientNotice::Connected {
                    attempt: connections,
                });
                connections += 1;

                match pump(ws, config.format, rejoin, &mut outbound, &notices).await {
                    PumpExit::OwnerGone => {
                        debug!("Client handle dropped, stopping");
                        return;
                    }
                    PumpExit::Dropped(reason) => {
                        warn!(reason = %reason, "Signaling connection lost");
                        if notices.send(ClientNotice::Disconnected).is_err() {
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                failures += 1;
                warn!(url = %url, attempt = failures, error = %e, "Signaling connect failed");
                if config.max_attempts.is_some_and(|max| failures >= max) {
                    let _ = notices.send(ClientNotice::GaveUp);
                    return;
                }
            }
        }

        tokio::time::sleep(config.retry_interval).await;
    }
}

enum PumpExit {
    OwnerGone,
    Dropped(String),
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn pump(
    ws: WsStream,
    format: WireFormat,
    rejoin: Vec<ClientEvent>,
    outbound: &mut mpsc::UnboundedReceiver<ClientEvent>,
    notices: &mpsc::UnboundedSender<ClientNotice>,
) -> PumpExit {
    let (mut sender, mut receiver) = ws.split();
    let mut read_buffer = BytesMut::with_capacity(4096);

    for event in rejoin {
        if let Err(e) = send_event(&mut sender, format, &event).await {
            return PumpExit::Dropped(e.to_string());
        }
    }

    loop {
        tokio::select! {
            event = outbound.recv() => {
                let Some(event) = event else {
                    let _ = sender.close().await;
                    return PumpExit::OwnerGone;
                };
                if let Err(e) = send_event(&mut sender, format, &event).await {
                    return PumpExit::Dropped(e.to_string());
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match codec::decode_json::<ServerEvent>(&text) {
                            Ok(event) => {
                                if notices.send(ClientNotice::Event(event)).is_err() {
                                    return PumpExit::OwnerGone;
                                }
                            }
                            Err(e) => warn!(error = %e, "Undecodable server event"),
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        read_buffer.extend_from_slice(&data);
                        loop {
                            match codec::decode_from::<ServerEvent>(&mut read_buffer) {
                                Ok(Some(event)) => {
                                    if notices.send(ClientNotice::Event(event)).is_err() {
                                        return PumpExit::OwnerGone;
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    warn!(error = %e, "Undecodable server frame");
                                    read_buffer.clear();
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            return PumpExit::Dropped(e.to_string());
                        }
                    }
                    Some(Ok(Message::Close(_))) => return PumpExit::Dropped("closed by server".into()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return PumpExit::Dropped(e.to_string()),
                    None => return PumpExit::Dropped("stream ended".into()),
                }
            }
        }
    }
}

async fn send_event<S>(
    sender: &mut S,
    format: WireFormat,
    event: &ClientEvent,
) -> Result<(), TransportError>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let message = match format {
        WireFormat::Json => Message::Text(codec::encode_json(event)?),
        WireFormat::MessagePack => Message::Binary(codec::encode(event)?.to_vec()),
    };
    sender
        .send(message)
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))
}
