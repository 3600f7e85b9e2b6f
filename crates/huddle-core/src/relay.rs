//! Signaling relay.
//!
//! The relay turns inbound [`ClientEvent`]s into registry mutations and
//! fans the resulting [`ServerEvent`]s out to room members through each
//! connection's [`EventSink`].

use crate::registry::{JoinOutcome, RegistryError, RoomRegistry, Visibility};
use dashmap::DashMap;
use huddle_protocol::{ClientEvent, ServerEvent};
use huddle_transport::{ConnectionId, EventSink};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Registry rejected a membership change.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Outcome of a fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Recipients the event was queued for.
    pub delivered: usize,
    /// Recipients whose sink rejected the event or was missing.
    pub failed: usize,
}

impl Delivery {
    fn merge(&mut self, other: Delivery) {
        self.delivered += other.delivered;
        self.failed += other.failed;
    }
}

/// The signaling relay.
pub struct Relay {
    registry: Arc<RoomRegistry>,
    sinks: DashMap<ConnectionId, Arc<dyn EventSink>>,
}

impl Relay {
    /// Create a relay over a registry.
    #[must_use]
    pub fn new(registry: Arc<RoomRegistry>) -> Self {
        Self {
            registry,
            sinks: DashMap::new(),
        }
    }

    /// Get the registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Register the outbound sink of a connection.
    pub fn attach(&self, connection: ConnectionId, sink: Arc<dyn EventSink>) {
        debug!(connection = %connection, "Attached sink");
        self.sinks.insert(connection, sink);
    }

    /// Drop the outbound sink of a connection.
    pub fn detach(&self, connection: &ConnectionId) {
        if self.sinks.remove(connection).is_some() {
            debug!(connection = %connection, "Detached sink");
        }
    }

    /// Number of attached connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.sinks.len()
    }

    /// Handle one inbound event from `connection`.
    ///
    /// # Errors
    ///
    /// Returns an error if a join is rejected by the registry. Every other
    /// problem (unknown rooms, foreign memberships, unknown call targets)
    /// makes the event a no-op.
    pub fn handle(
        &self,
        connection: &ConnectionId,
        event: ClientEvent,
    ) -> Result<Delivery, RelayError> {
        trace!(connection = %connection, kind = %event.kind(), "Handling event");

        let delivery = match event {
            ClientEvent::JoinRoom { room, participant } => {
                let outcome =
                    self.registry
                        .join(&room, &participant, connection, Visibility::Announced)?;
                if outcome == JoinOutcome::Rejoined {
                    Delivery::default()
                } else {
                    debug!(room = %room, participant = %participant, ?outcome, "Participant joined");
                    self.broadcast(
                        &room,
                        Some(connection),
                        ServerEvent::user_connected(&room, &participant),
                    )
                }
            }

            ClientEvent::LeaveRoom { room, participant } => {
                match self
                    .registry
                    .leave_connection(&room, &participant, connection)
                {
                    Some(member) if member.visibility == Visibility::Announced => {
                        debug!(room = %room, participant = %participant, "Participant left");
                        self.broadcast(
                            &room,
                            Some(connection),
                            ServerEvent::user_disconnected(&room, &participant),
                        )
                    }
                    _ => Delivery::default(),
                }
            }

            ClientEvent::Subscribe { room, participant } => {
                self.registry
                    .join(&room, &participant, connection, Visibility::Silent)?;
                Delivery::default()
            }

            ClientEvent::Unsubscribe { room, participant } => {
                self.registry
                    .leave_connection(&room, &participant, connection);
                Delivery::default()
            }

            ClientEvent::StreamUpdated { room, participant } => {
                self.relay_from_member(connection, &room, &participant, || {
                    ServerEvent::UserStreamUpdated {
                        room: room.clone(),
                        participant: participant.clone(),
                    }
                })
            }

            ClientEvent::Typing { room, user } => {
                self.relay_from_member(connection, &room, &user, || ServerEvent::UserTyping {
                    room: room.clone(),
                    user: user.clone(),
                })
            }

            ClientEvent::StopTyping { room, user } => {
                self.relay_from_member(connection, &room, &user, || {
                    ServerEvent::UserStoppedTyping {
                        room: room.clone(),
                        user: user.clone(),
                    }
                })
            }

            ClientEvent::PeerReady { room, participant } => {
                self.relay_from_member(connection, &room, &participant, || {
                    ServerEvent::UserReady {
                        room: room.clone(),
                        participant: participant.clone(),
                    }
                })
            }

            ClientEvent::Call {
                from,
                target,
                signal,
            } => {
                if self.registry.connection_of(&from).as_ref() != Some(connection) {
                    debug!(connection = %connection, from = %from, "Dropping call from unowned identity");
                    Delivery::default()
                } else {
                    self.send_to_participant(&target, ServerEvent::Call { from, signal })
                }
            }

            ClientEvent::Ping { timestamp } => {
                self.send_to_connection(connection, ServerEvent::Pong { timestamp })
            }
        };

        Ok(delivery)
    }

    /// Remove a connection from every room it still holds and announce the
    /// departures.
    pub fn disconnect(&self, connection: &ConnectionId) -> Delivery {
        self.detach(connection);

        let mut delivery = Delivery::default();
        for departure in self.registry.disconnect(connection) {
            if departure.visibility == Visibility::Announced {
                delivery.merge(self.broadcast(
                    &departure.room,
                    Some(connection),
                    ServerEvent::user_disconnected(&departure.room, &departure.participant),
                ));
            }
        }
        delivery
    }

    /// Deliver `event` to every connection in `room` except `sender`.
    ///
    /// A failing recipient is logged and counted; delivery to the others
    /// continues.
    pub fn broadcast(
        &self,
        room: &str,
        sender: Option<&ConnectionId>,
        event: ServerEvent,
    ) -> Delivery {
        let event = Arc::new(event);
        let mut delivery = Delivery::default();

        for recipient in self.registry.connections_in(room) {
            if Some(&recipient) == sender {
                continue;
            }
            if self.deliver(&recipient, Arc::clone(&event)) {
                delivery.delivered += 1;
            } else {
                delivery.failed += 1;
            }
        }

        trace!(
            room = %room,
            kind = %event.kind(),
            delivered = delivery.delivered,
            failed = delivery.failed,
            "Broadcast"
        );
        delivery
    }

    /// Deliver a server-originated event to every connection in `room`.
    pub fn send_to_room(&self, room: &str, event: ServerEvent) -> Delivery {
        self.broadcast(room, None, event)
    }

    /// Deliver an event to the connection a participant last joined from.
    ///
    /// Unknown participants are a no-op.
    pub fn send_to_participant(&self, participant: &str, event: ServerEvent) -> Delivery {
        match self.registry.connection_of(participant) {
            Some(connection) => self.send_to_connection(&connection, event),
            None => {
                trace!(participant = %participant, "No connection for participant");
                Delivery::default()
            }
        }
    }

    /// Deliver an event to one connection.
    pub fn send_to_connection(&self, connection: &ConnectionId, event: ServerEvent) -> Delivery {
        if self.deliver(connection, Arc::new(event)) {
            Delivery {
                delivered: 1,
                failed: 0,
            }
        } else {
            Delivery {
                delivered: 0,
                failed: 1,
            }
        }
    }

    fn relay_from_member(
        &self,
        connection: &ConnectionId,
        room: &str,
        participant: &str,
        event: impl FnOnce() -> ServerEvent,
    ) -> Delivery {
        if !self.registry.holds(room, participant, connection) {
            debug!(
                connection = %connection,
                room = %room,
                participant = %participant,
                "Dropping event from non-member"
            );
            return Delivery::default();
        }
        self.broadcast(room, Some(connection), event())
    }

    fn deliver(&self, connection: &ConnectionId, event: Arc<ServerEvent>) -> bool {
        let Some(sink) = self.sinks.get(connection).map(|s| Arc::clone(s.value())) else {
            debug!(connection = %connection, "No sink attached");
            return false;
        };

        match sink.deliver(event) {
            Ok(()) => true,
            Err(e) => {
                warn!(connection = %connection, error = %e, "Delivery failed");
                false
            }
        }
    }
}
