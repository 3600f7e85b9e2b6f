//! Room registry for Huddle.
//!
//! The registry maps room identifiers to the participants currently present
//! in them, each bound to the connection that joined it. A reverse index
//! from connection to memberships makes disconnect cleanup proportional to
//! what that connection actually holds, and a participant directory routes
//! point-to-point calls.

use dashmap::DashMap;
use huddle_transport::ConnectionId;
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, trace};

/// Maximum room name length.
pub const MAX_ROOM_NAME_LENGTH: usize = 256;

/// A room identifier.
pub type RoomId = String;

/// A participant identity, as supplied by the client.
pub type ParticipantId = String;

/// Validate a room name.
///
/// # Errors
///
/// Returns an error message if the room name is invalid.
pub fn validate_room_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Room name cannot be empty");
    }
    if name.len() > MAX_ROOM_NAME_LENGTH {
        return Err("Room name too long");
    }
    if name.starts_with('$') {
        return Err("Room names starting with '$' are reserved");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Room name contains invalid characters");
    }
    Ok(())
}

/// Registry errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Invalid room name.
    #[error("Invalid room name: {0}")]
    InvalidRoom(&'static str),

    /// The connection holds the maximum number of memberships.
    #[error("Maximum memberships per connection reached")]
    LimitReached,
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum memberships a single connection may hold.
    pub max_rooms_per_connection: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_rooms_per_connection: 100,
        }
    }
}

/// Whether a membership is announced to the rest of the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Arrival and departure are broadcast.
    Announced,
    /// Membership only receives room traffic.
    Silent,
}

/// A participant's presence in one room.
#[derive(Debug, Clone)]
pub struct Member {
    pub participant: ParticipantId,
    pub connection: ConnectionId,
    pub visibility: Visibility,
    pub joined_at: Instant,
}

/// Result of a join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The participant was not in the room.
    Joined,
    /// The participant was already in the room on the same connection.
    Rejoined,
    /// The participant was in the room on another connection, which lost
    /// the membership.
    Replaced { previous: ConnectionId },
}

/// A membership removed by [`RoomRegistry::disconnect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub room: RoomId,
    pub participant: ParticipantId,
    pub visibility: Visibility,
}

/// Registry statistics.
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    /// Number of non-empty rooms.
    pub room_count: usize,
    /// Number of connections holding at least one membership.
    pub connection_count: usize,
    /// Total memberships across all rooms.
    pub membership_count: usize,
}

/// Room membership registry.
///
/// Each room is one map entry, so mutations of a room are serialized by
/// that entry's shard lock while unrelated rooms proceed independently.
/// No method holds guards on two maps at the same time.
pub struct RoomRegistry {
    /// Room -> participant -> member.
    rooms: DashMap<RoomId, HashMap<ParticipantId, Member>>,
    /// Connection -> memberships it holds.
    memberships: DashMap<ConnectionId, HashSet<(RoomId, ParticipantId)>>,
    /// Participant -> connection it last joined from.
    directory: DashMap<ParticipantId, ConnectionId>,
    config: RegistryConfig,
}

impl RoomRegistry {
    /// Create a new registry with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a new registry with custom configuration.
    #[must_use]
    pub fn with_config(config: RegistryConfig) -> Self {
        info!("Creating room registry with config: {:?}", config);
        Self {
            rooms: DashMap::new(),
            memberships: DashMap::new(),
            directory: DashMap::new(),
            config,
        }
    }

    /// Add `participant` to `room` on `connection`.
    ///
    /// Joining twice is harmless. If the participant is present under a
    /// different connection, the newer connection wins and the stale
    /// connection loses this membership.
    ///
    /// A silent membership upgraded to an announced one reports
    /// [`JoinOutcome::Joined`], since the room has not yet been told.
    ///
    /// # Errors
    ///
    /// Returns an error if the room name is invalid or the connection holds
    /// too many memberships.
    pub fn join(
        &self,
        room: &str,
        participant: &str,
        connection: &ConnectionId,
        visibility: Visibility,
    ) -> Result<JoinOutcome, RegistryError> {
        validate_room_name(room).map_err(RegistryError::InvalidRoom)?;

        let key = (room.to_string(), participant.to_string());
        if let Some(held) = self.memberships.get(connection) {
            if !held.contains(&key) && held.len() >= self.config.max_rooms_per_connection {
                return Err(RegistryError::LimitReached);
            }
        }

        let outcome = {
            let mut members = self.rooms.entry(room.to_string()).or_default();
            let previous = members.get(participant).cloned();

            let (outcome, visibility) = match previous {
                None => (JoinOutcome::Joined, visibility),
                Some(prev) if &prev.connection == connection => {
                    if prev.visibility == Visibility::Silent
                        && visibility == Visibility::Announced
                    {
                        (JoinOutcome::Joined, Visibility::Announced)
                    } else {
                        (JoinOutcome::Rejoined, prev.visibility)
                    }
                }
                Some(prev) => (
                    JoinOutcome::Replaced {
                        previous: prev.connection,
                    },
                    visibility,
                ),
            };

            let joined_at = match (&outcome, members.get(participant)) {
                (JoinOutcome::Rejoined, Some(existing)) => existing.joined_at,
                _ => Instant::now(),
            };

            members.insert(
                participant.to_string(),
                Member {
                    participant: participant.to_string(),
                    connection: connection.clone(),
                    visibility,
                    joined_at,
                },
            );
            outcome
        };

        self.memberships
            .entry(connection.clone())
            .or_default()
            .insert(key.clone());

        if let JoinOutcome::Replaced { previous } = &outcome {
            self.forget_membership(previous, &key);
            debug!(
                room = %room,
                participant = %participant,
                previous = %previous,
                connection = %connection,
                "Replaced stale membership"
            );
        }

        self.directory
            .insert(participant.to_string(), connection.clone());

        trace!(room = %room, participant = %participant, connection = %connection, ?outcome, "Joined");
        Ok(outcome)
    }

    /// Remove `participant` from `room`, whichever connection holds it.
    ///
    /// Absent memberships are not an error.
    pub fn leave(&self, room: &str, participant: &str) -> Option<Member> {
        self.remove_member(room, participant, None)
    }

    /// Remove `participant` from `room` only if `connection` holds it.
    pub fn leave_connection(
        &self,
        room: &str,
        participant: &str,
        connection: &ConnectionId,
    ) -> Option<Member> {
        self.remove_member(room, participant, Some(connection))
    }

    /// Remove every membership still held by `connection`.
    ///
    /// Memberships that a newer connection took over are left alone.
    /// Calling this after explicit leaves, or twice, is harmless.
    pub fn disconnect(&self, connection: &ConnectionId) -> Vec<Departure> {
        let Some((_, held)) = self.memberships.remove(connection) else {
            return Vec::new();
        };

        let mut departures = Vec::with_capacity(held.len());
        for (room, participant) in held {
            if let Some(member) = self.take_from_room(&room, &participant, Some(connection)) {
                departures.push(Departure {
                    room,
                    participant,
                    visibility: member.visibility,
                });
            }
        }

        for departure in &departures {
            self.directory
                .remove_if(&departure.participant, |_, c| c == connection);
        }

        debug!(
            connection = %connection,
            departures = departures.len(),
            "Connection removed from all rooms"
        );
        departures
    }

    /// Snapshot of participants in a room, sorted.
    #[must_use]
    pub fn members_of(&self, room: &str) -> Vec<ParticipantId> {
        let mut participants: Vec<_> = self
            .rooms
            .get(room)
            .map(|members| members.keys().cloned().collect())
            .unwrap_or_default();
        participants.sort();
        participants
    }

    /// Distinct connections holding a membership in a room.
    #[must_use]
    pub fn connections_in(&self, room: &str) -> Vec<ConnectionId> {
        let Some(members) = self.rooms.get(room) else {
            return Vec::new();
        };
        let mut connections: Vec<_> = members.values().map(|m| m.connection.clone()).collect();
        drop(members);

        connections.sort();
        connections.dedup();
        connections
    }

    /// Check whether `connection` holds `participant`'s membership in `room`.
    #[must_use]
    pub fn holds(&self, room: &str, participant: &str, connection: &ConnectionId) -> bool {
        self.rooms
            .get(room)
            .and_then(|members| members.get(participant).map(|m| &m.connection == connection))
            .unwrap_or(false)
    }

    /// Connection a participant last joined from.
    #[must_use]
    pub fn connection_of(&self, participant: &str) -> Option<ConnectionId> {
        self.directory.get(participant).map(|c| c.value().clone())
    }

    /// Rooms a connection holds memberships in, sorted and deduplicated.
    #[must_use]
    pub fn rooms_of(&self, connection: &ConnectionId) -> Vec<RoomId> {
        let mut rooms: Vec<_> = self
            .memberships
            .get(connection)
            .map(|held| held.iter().map(|(room, _)| room.clone()).collect())
            .unwrap_or_default();
        rooms.sort();
        rooms.dedup();
        rooms
    }

    /// Check if a room exists.
    #[must_use]
    pub fn room_exists(&self, room: &str) -> bool {
        self.rooms.contains_key(room)
    }

    /// Number of participants in a room.
    #[must_use]
    pub fn member_count(&self, room: &str) -> usize {
        self.rooms.get(room).map(|m| m.len()).unwrap_or(0)
    }

    /// Get the per-connection membership limit.
    #[must_use]
    pub fn max_rooms_per_connection(&self) -> usize {
        self.config.max_rooms_per_connection
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            room_count: self.rooms.len(),
            connection_count: self.memberships.len(),
            membership_count: self.rooms.iter().map(|r| r.len()).sum(),
        }
    }

    fn remove_member(
        &self,
        room: &str,
        participant: &str,
        connection: Option<&ConnectionId>,
    ) -> Option<Member> {
        let member = self.take_from_room(room, participant, connection)?;
        let key = (room.to_string(), participant.to_string());
        self.forget_membership(&member.connection, &key);

        let still_present = self
            .memberships
            .get(&member.connection)
            .map(|held| held.iter().any(|(_, p)| p == participant))
            .unwrap_or(false);
        if !still_present {
            self.directory
                .remove_if(participant, |_, c| c == &member.connection);
        }

        trace!(room = %room, participant = %participant, connection = %member.connection, "Left");
        Some(member)
    }

    /// Remove a member from a room's entry, dropping the room once empty.
    fn take_from_room(
        &self,
        room: &str,
        participant: &str,
        connection: Option<&ConnectionId>,
    ) -> Option<Member> {
        let member = {
            let mut members = self.rooms.get_mut(room)?;
            let matches = members
                .get(participant)
                .map(|m| connection.map_or(true, |c| &m.connection == c))
                .unwrap_or(false);
            if !matches {
                return None;
            }
            members.remove(participant)?
        };

        if self.rooms.remove_if(room, |_, members| members.is_empty()).is_some() {
            debug!(room = %room, "Deleted empty room");
        }
        Some(member)
    }

    fn forget_membership(&self, connection: &ConnectionId, key: &(RoomId, ParticipantId)) {
        if let Some(mut held) = self.memberships.get_mut(connection) {
            held.remove(key);
        }
        self.memberships.remove_if(connection, |_, held| held.is_empty());
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}
