//! Peer negotiation coordinator.
//!
//! Client-side state machine that turns room membership events into
//! pairwise offer/answer/candidate exchanges. One [`PeerLink`] is kept per
//! remote participant:
//!
//! ```text
//! Idle ──dial──▶ OfferSent ──answer──▶ Answered ──transport up──▶ Connected
//!   │                                     ▲
//!   └──offer──▶ OfferReceived ──answer────┘
//! ```
//!
//! Any link may be closed at any time; closing one link never touches the
//! others. Media is driven through [`MediaSession`] and outbound calls go
//! through [`CallSignaler`], so the coordinator runs without a browser or a
//! socket in tests.

use crate::registry::{ParticipantId, RoomId};
use async_trait::async_trait;
use huddle_protocol::{CallSignal, ClientEvent, ServerEvent};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Negotiation errors.
#[derive(Debug, Error)]
pub enum NegotiationError {
    /// The media layer failed.
    #[error("Media error: {0}")]
    Media(String),

    /// The call could not be sent.
    #[error("Signaling error: {0}")]
    Signal(String),
}

/// State of one peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    OfferSent,
    OfferReceived,
    Answered,
    Connected,
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Idle => "idle",
            LinkState::OfferSent => "offer-sent",
            LinkState::OfferReceived => "offer-received",
            LinkState::Answered => "answered",
            LinkState::Connected => "connected",
            LinkState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Local media track kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// One link between the local participant and a remote participant.
#[derive(Debug, Clone)]
pub struct PeerLink {
    pub remote: ParticipantId,
    pub state: LinkState,
    /// Candidates received before the remote description was applied.
    pub pending_candidates: Vec<CallSignal>,
    /// Remote audio muted locally.
    pub muted: bool,
    /// Remote video hidden locally.
    pub hidden: bool,
    /// A fresh offer was sent on an already connected link.
    pub renegotiating: bool,
}

impl PeerLink {
    fn new(remote: impl Into<ParticipantId>, state: LinkState) -> Self {
        Self {
            remote: remote.into(),
            state,
            pending_candidates: Vec::new(),
            muted: false,
            hidden: false,
            renegotiating: false,
        }
    }
}

/// The media side of a call.
#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Create a local offer for `remote`.
    async fn create_offer(&self, remote: &str) -> Result<String, NegotiationError>;

    /// Apply a remote offer and create the matching answer.
    async fn create_answer(&self, remote: &str, offer: &str) -> Result<String, NegotiationError>;

    /// Apply the remote answer to our offer.
    async fn apply_answer(&self, remote: &str, answer: &str) -> Result<(), NegotiationError>;

    /// Apply a remote connectivity candidate.
    async fn add_candidate(&self, remote: &str, candidate: &CallSignal)
        -> Result<(), NegotiationError>;

    /// Swap the outgoing tracks in place.
    ///
    /// Returns `false` when in-place replacement is unsupported and the
    /// link must be renegotiated.
    async fn replace_tracks(&self, remote: &str) -> Result<bool, NegotiationError>;

    /// Tear down the media for `remote`.
    async fn close(&self, remote: &str);

    /// Enable or disable a local track for every link.
    async fn set_track_enabled(&self, kind: TrackKind, enabled: bool);
}

/// Outbound call channel.
pub trait CallSignaler: Send + Sync {
    /// Send an event to the signaling server.
    ///
    /// # Errors
    ///
    /// Returns an error if the event could not be queued.
    fn send(&self, event: ClientEvent) -> Result<(), NegotiationError>;
}

impl CallSignaler for huddle_transport::SignalClient {
    fn send(&self, event: ClientEvent) -> Result<(), NegotiationError> {
        huddle_transport::SignalClient::send(self, event)
            .map_err(|e| NegotiationError::Signal(e.to_string()))
    }
}

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    /// Delay between learning about a new participant and dialing it, when
    /// no ready notice arrives first.
    pub dial_delay: Duration,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            dial_delay: Duration::from_secs(1),
        }
    }
}

/// What the caller should do after a server event was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Followup {
    /// Nothing.
    None,
    /// Call [`PeerCoordinator::dial`] for `remote` after `delay`.
    DialAfter { remote: ParticipantId, delay: Duration },
    /// Re-render the remote participant's media surface.
    RefreshRemote { remote: ParticipantId },
    /// The link to `remote` was torn down.
    Closed { remote: ParticipantId },
}

/// Drives one peer link per remote participant in a room.
pub struct PeerCoordinator<M, S> {
    local: ParticipantId,
    room: RoomId,
    media: M,
    signaler: S,
    links: HashMap<ParticipantId, PeerLink>,
    config: NegotiatorConfig,
}

impl<M: MediaSession, S: CallSignaler> PeerCoordinator<M, S> {
    /// Create a coordinator for `local` in `room`.
    pub fn new(
        local: impl Into<ParticipantId>,
        room: impl Into<RoomId>,
        media: M,
        signaler: S,
        config: NegotiatorConfig,
    ) -> Self {
        Self {
            local: local.into(),
            room: room.into(),
            media,
            signaler,
            links: HashMap::new(),
            config,
        }
    }

    /// The local participant.
    #[must_use]
    pub fn local(&self) -> &str {
        &self.local
    }

    /// The media session.
    #[must_use]
    pub fn media(&self) -> &M {
        &self.media
    }

    /// State of the link to `remote`, if one exists.
    #[must_use]
    pub fn state_of(&self, remote: &str) -> Option<LinkState> {
        self.links.get(remote).map(|l| l.state)
    }

    /// The link to `remote`, if one exists.
    #[must_use]
    pub fn link(&self, remote: &str) -> Option<&PeerLink> {
        self.links.get(remote)
    }

    /// Number of open links.
    #[must_use]
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// The event that announces this participant is ready to be dialed.
    #[must_use]
    pub fn ready_event(&self) -> ClientEvent {
        ClientEvent::peer_ready(&self.room, &self.local)
    }

    /// Apply a server event addressed to this room.
    ///
    /// # Errors
    ///
    /// Returns an error if media or signaling failed; the affected link is
    /// closed before returning.
    pub async fn on_server_event(
        &mut self,
        event: &ServerEvent,
    ) -> Result<Followup, NegotiationError> {
        match event {
            ServerEvent::UserConnected { room, participant } if room == &self.room => {
                Ok(self
                    .on_user_connected(participant)
                    .map_or(Followup::None, |delay| Followup::DialAfter {
                        remote: participant.clone(),
                        delay,
                    }))
            }
            ServerEvent::UserReady { room, participant } if room == &self.room => {
                self.on_user_ready(participant).await?;
                Ok(Followup::None)
            }
            ServerEvent::UserDisconnected { room, participant } if room == &self.room => {
                Ok(if self.on_user_disconnected(participant).await {
                    Followup::Closed {
                        remote: participant.clone(),
                    }
                } else {
                    Followup::None
                })
            }
            ServerEvent::UserStreamUpdated { room, participant } if room == &self.room => {
                Ok(if self.on_stream_updated(participant) {
                    Followup::RefreshRemote {
                        remote: participant.clone(),
                    }
                } else {
                    Followup::None
                })
            }
            ServerEvent::Call { from, signal } => {
                self.on_call(from, signal.clone()).await?;
                Ok(Followup::None)
            }
            _ => Ok(Followup::None),
        }
    }

    /// A participant joined after us.
    ///
    /// Creates an idle link and returns how long to wait before dialing, or
    /// `None` if a link already exists.
    pub fn on_user_connected(&mut self, remote: &str) -> Option<Duration> {
        if remote == self.local || self.links.contains_key(remote) {
            return None;
        }
        self.links
            .insert(remote.to_string(), PeerLink::new(remote, LinkState::Idle));
        debug!(local = %self.local, remote = %remote, "New peer, scheduling dial");
        Some(self.config.dial_delay)
    }

    /// The remote participant announced it can be dialed.
    ///
    /// # Errors
    ///
    /// Returns an error if the offer could not be created or sent.
    pub async fn on_user_ready(&mut self, remote: &str) -> Result<(), NegotiationError> {
        if remote == self.local {
            return Ok(());
        }
        self.links
            .entry(remote.to_string())
            .or_insert_with(|| PeerLink::new(remote, LinkState::Idle));
        self.dial(remote).await
    }

    /// Send an offer to `remote`.
    ///
    /// Does nothing unless the link exists and is idle, so a dial scheduled
    /// before the participant left, or before an earlier dial, is harmless.
    ///
    /// # Errors
    ///
    /// Returns an error if the offer could not be created or sent.
    pub async fn dial(&mut self, remote: &str) -> Result<(), NegotiationError> {
        if self.state_of(remote) != Some(LinkState::Idle) {
            return Ok(());
        }

        let result = self.send_offer(remote).await;
        match result {
            Ok(()) => {
                self.set_state(remote, LinkState::OfferSent);
                Ok(())
            }
            Err(e) => {
                self.fail(remote, &e).await;
                Err(e)
            }
        }
    }

    /// Apply a negotiation payload from `from`.
    ///
    /// # Errors
    ///
    /// Returns an error if media or signaling failed; the link is closed.
    pub async fn on_call(&mut self, from: &str, signal: CallSignal) -> Result<(), NegotiationError> {
        let result = match signal {
            CallSignal::Offer { sdp } => self.accept_offer(from, &sdp).await,
            CallSignal::Answer { sdp } => self.accept_answer(from, &sdp).await,
            candidate @ CallSignal::Candidate { .. } => self.accept_candidate(from, candidate).await,
        };

        if let Err(e) = &result {
            self.fail(from, e).await;
        }
        result
    }

    /// The media transport to `remote` came up.
    pub fn on_transport_connected(&mut self, remote: &str) {
        if let Some(link) = self.links.get_mut(remote) {
            if link.state == LinkState::Answered {
                link.state = LinkState::Connected;
                info!(local = %self.local, remote = %remote, "Peer link connected");
            }
        }
    }

    /// The remote participant left the room.
    ///
    /// Returns `true` if a link was closed.
    pub async fn on_user_disconnected(&mut self, remote: &str) -> bool {
        self.close_link(remote).await
    }

    /// The media transport to `remote` failed.
    pub async fn on_link_failed(&mut self, remote: &str, reason: &str) -> bool {
        warn!(local = %self.local, remote = %remote, reason = %reason, "Peer link failed");
        self.close_link(remote).await
    }

    /// The local media source changed.
    ///
    /// Every connected link first tries an in-place track swap; links where
    /// that is unsupported are renegotiated with a fresh offer. Returns the
    /// event that tells the room about the switch.
    ///
    /// # Errors
    ///
    /// Returns the first media or signaling error; the failing link is
    /// closed and the remaining links are still processed.
    pub async fn switch_source(&mut self) -> Result<ClientEvent, NegotiationError> {
        let connected: Vec<ParticipantId> = self
            .links
            .values()
            .filter(|l| l.state == LinkState::Connected)
            .map(|l| l.remote.clone())
            .collect();

        let mut first_error = None;
        for remote in connected {
            let result = match self.media.replace_tracks(&remote).await {
                Ok(true) => Ok(()),
                Ok(false) => self.renegotiate(&remote).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                self.fail(&remote, &e).await;
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(ClientEvent::stream_updated(&self.room, &self.local)),
        }
    }

    /// The remote participant switched its media source.
    ///
    /// Returns `true` if the remote surface should be refreshed.
    #[must_use]
    pub fn on_stream_updated(&self, remote: &str) -> bool {
        self.links
            .get(remote)
            .is_some_and(|l| l.state != LinkState::Closed)
    }

    /// Enable or disable a local track on every link.
    pub async fn set_track_enabled(&self, kind: TrackKind, enabled: bool) {
        debug!(local = %self.local, ?kind, enabled, "Local track toggled");
        self.media.set_track_enabled(kind, enabled).await;
    }

    /// Mute a remote participant locally. Returns `false` for unknown links.
    pub fn set_remote_muted(&mut self, remote: &str, muted: bool) -> bool {
        match self.links.get_mut(remote) {
            Some(link) => {
                link.muted = muted;
                true
            }
            None => false,
        }
    }

    /// Hide a remote participant's video locally. Returns `false` for
    /// unknown links.
    pub fn set_remote_hidden(&mut self, remote: &str, hidden: bool) -> bool {
        match self.links.get_mut(remote) {
            Some(link) => {
                link.hidden = hidden;
                true
            }
            None => false,
        }
    }

    async fn accept_offer(&mut self, from: &str, sdp: &str) -> Result<(), NegotiationError> {
        let previous = self.state_of(from);
        let renegotiating = self.links.get(from).is_some_and(|l| l.renegotiating);

        if previous == Some(LinkState::OfferSent) {
            if self.local.as_str() < from {
                debug!(local = %self.local, remote = %from, "Offer collision, keeping ours");
                return Ok(());
            }
            debug!(local = %self.local, remote = %from, "Offer collision, yielding");
        }

        // A yielded renegotiation still rides on a live transport
        let live = previous == Some(LinkState::Connected)
            || (previous == Some(LinkState::OfferSent) && renegotiating);

        let link = self
            .links
            .entry(from.to_string())
            .or_insert_with(|| PeerLink::new(from, LinkState::Idle));
        link.renegotiating = false;
        link.state = if live {
            LinkState::Connected
        } else {
            LinkState::OfferReceived
        };

        let answer = self.media.create_answer(from, sdp).await?;
        self.signaler
            .send(ClientEvent::call(&self.local, from, CallSignal::Answer { sdp: answer }))?;

        if !live {
            self.set_state(from, LinkState::Answered);
        }
        self.flush_candidates(from).await?;

        if previous == Some(LinkState::OfferSent) && renegotiating {
            debug!(local = %self.local, remote = %from, "Re-sending yielded renegotiation offer");
            self.renegotiate(from).await?;
        }
        Ok(())
    }

    async fn accept_answer(&mut self, from: &str, sdp: &str) -> Result<(), NegotiationError> {
        let Some(link) = self.links.get(from) else {
            debug!(remote = %from, "Answer for unknown link");
            return Ok(());
        };
        if link.state != LinkState::OfferSent {
            debug!(remote = %from, state = %link.state, "Ignoring unexpected answer");
            return Ok(());
        }
        let renegotiating = link.renegotiating;

        self.media.apply_answer(from, sdp).await?;

        if let Some(link) = self.links.get_mut(from) {
            link.renegotiating = false;
            link.state = if renegotiating {
                LinkState::Connected
            } else {
                LinkState::Answered
            };
        }
        self.flush_candidates(from).await
    }

    async fn accept_candidate(
        &mut self,
        from: &str,
        candidate: CallSignal,
    ) -> Result<(), NegotiationError> {
        let Some(link) = self.links.get_mut(from) else {
            debug!(remote = %from, "Dropping candidate for unknown link");
            return Ok(());
        };

        match link.state {
            LinkState::Idle | LinkState::OfferSent => {
                link.pending_candidates.push(candidate);
                Ok(())
            }
            LinkState::Closed => Ok(()),
            _ => self.media.add_candidate(from, &candidate).await,
        }
    }

    async fn flush_candidates(&mut self, remote: &str) -> Result<(), NegotiationError> {
        let pending = match self.links.get_mut(remote) {
            Some(link) => std::mem::take(&mut link.pending_candidates),
            None => return Ok(()),
        };
        for candidate in &pending {
            self.media.add_candidate(remote, candidate).await?;
        }
        Ok(())
    }

    async fn send_offer(&self, remote: &str) -> Result<(), NegotiationError> {
        let sdp = self.media.create_offer(remote).await?;
        self.signaler
            .send(ClientEvent::call(&self.local, remote, CallSignal::Offer { sdp }))
    }

    async fn renegotiate(&mut self, remote: &str) -> Result<(), NegotiationError> {
        self.send_offer(remote).await?;
        if let Some(link) = self.links.get_mut(remote) {
            link.state = LinkState::OfferSent;
            link.renegotiating = true;
        }
        Ok(())
    }

    fn set_state(&mut self, remote: &str, state: LinkState) {
        if let Some(link) = self.links.get_mut(remote) {
            debug!(local = %self.local, remote = %remote, from = %link.state, to = %state, "Link transition");
            link.state = state;
        }
    }

    async fn fail(&mut self, remote: &str, error: &NegotiationError) {
        warn!(local = %self.local, remote = %remote, error = %error, "Negotiation failed");
        self.close_link(remote).await;
    }

    async fn close_link(&mut self, remote: &str) -> bool {
        let Some(mut link) = self.links.remove(remote) else {
            return false;
        };
        link.state = LinkState::Closed;
        self.media.close(remote).await;
        debug!(local = %self.local, remote = %remote, "Link closed");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeMedia {
        log: Mutex<Vec<String>>,
        in_place_swap: bool,
        fail_answers: bool,
    }

    impl FakeMedia {
        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn push(&self, entry: String) {
            self.log.lock().unwrap().push(entry);
        }
    }

    #[async_trait]
    impl MediaSession for FakeMedia {
        async fn create_offer(&self, remote: &str) -> Result<String, NegotiationError> {
            self.push(format!("offer:{remote}"));
            Ok(format!("offer-for-{remote}"))
        }

        async fn create_answer(&self, remote: &str, offer: &str) -> Result<String, NegotiationError> {
            if self.fail_answers {
                return Err(NegotiationError::Media("bad sdp".into()));
            }
            self.push(format!("answer:{remote}:{offer}"));
            Ok(format!("answer-for-{remote}"))
        }

        async fn apply_answer(&self, remote: &str, answer: &str) -> Result<(), NegotiationError> {
            self.push(format!("apply:{remote}:{answer}"));
            Ok(())
        }

        async fn add_candidate(
            &self,
            remote: &str,
            candidate: &CallSignal,
        ) -> Result<(), NegotiationError> {
            if let CallSignal::Candidate { candidate, .. } = candidate {
                self.push(format!("candidate:{remote}:{candidate}"));
            }
            Ok(())
        }

        async fn replace_tracks(&self, remote: &str) -> Result<bool, NegotiationError> {
            self.push(format!("replace:{remote}"));
            Ok(self.in_place_swap)
        }

        async fn close(&self, remote: &str) {
            self.push(format!("close:{remote}"));
        }

        async fn set_track_enabled(&self, kind: TrackKind, enabled: bool) {
            self.push(format!("track:{kind:?}:{enabled}"));
        }
    }

    #[derive(Clone, Default)]
    struct Outbox(Arc<Mutex<Vec<ClientEvent>>>);

    impl Outbox {
        fn take(&self) -> Vec<ClientEvent> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    impl CallSignaler for Outbox {
        fn send(&self, event: ClientEvent) -> Result<(), NegotiationError> {
            self.0.lock().unwrap().push(event);
            Ok(())
        }
    }

    fn coordinator(local: &str, media: FakeMedia) -> (PeerCoordinator<FakeMedia, Outbox>, Outbox) {
        let outbox = Outbox::default();
        let coordinator = PeerCoordinator::new(
            local,
            "abc",
            media,
            outbox.clone(),
            NegotiatorConfig::default(),
        );
        (coordinator, outbox)
    }

    #[tokio::test]
    async fn test_dial_after_user_connected() {
        let (mut p1, outbox) = coordinator("p1", FakeMedia::default());

        assert_eq!(p1.on_user_connected("p2"), Some(Duration::from_secs(1)));
        assert_eq!(p1.state_of("p2"), Some(LinkState::Idle));
        assert_eq!(p1.on_user_connected("p2"), None);

        p1.dial("p2").await.unwrap();
        assert_eq!(p1.state_of("p2"), Some(LinkState::OfferSent));
        assert_eq!(
            outbox.take(),
            vec![ClientEvent::call(
                "p1",
                "p2",
                CallSignal::Offer {
                    sdp: "offer-for-p2".into()
                }
            )]
        );

        // A second scheduled dial is a no-op
        p1.dial("p2").await.unwrap();
        assert!(outbox.take().is_empty());
    }

    #[tokio::test]
    async fn test_dial_after_departure_is_noop() {
        let (mut p1, outbox) = coordinator("p1", FakeMedia::default());

        p1.on_user_connected("p2");
        assert!(p1.on_user_disconnected("p2").await);
        p1.dial("p2").await.unwrap();

        assert!(outbox.take().is_empty());
        assert_eq!(p1.state_of("p2"), None);
    }

    #[tokio::test]
    async fn test_offer_answer_connected() {
        let (mut p2, outbox) = coordinator("p2", FakeMedia::default());

        p2.on_call("p1", CallSignal::Offer { sdp: "o1".into() })
            .await
            .unwrap();
        assert_eq!(p2.state_of("p1"), Some(LinkState::Answered));
        assert_eq!(
            outbox.take(),
            vec![ClientEvent::call(
                "p2",
                "p1",
                CallSignal::Answer {
                    sdp: "answer-for-p1".into()
                }
            )]
        );

        p2.on_transport_connected("p1");
        assert_eq!(p2.state_of("p1"), Some(LinkState::Connected));
    }

    #[tokio::test]
    async fn test_answer_only_accepted_in_offer_sent() {
        let (mut p1, _outbox) = coordinator("p1", FakeMedia::default());

        p1.on_user_connected("p2");
        p1.on_call("p2", CallSignal::Answer { sdp: "a".into() })
            .await
            .unwrap();
        assert_eq!(p1.state_of("p2"), Some(LinkState::Idle));

        p1.dial("p2").await.unwrap();
        p1.on_call("p2", CallSignal::Answer { sdp: "a".into() })
            .await
            .unwrap();
        assert_eq!(p1.state_of("p2"), Some(LinkState::Answered));
        assert!(p1.media().log().contains(&"apply:p2:a".to_string()));
    }

    #[tokio::test]
    async fn test_candidates_buffered_until_answer() {
        let (mut p1, _outbox) = coordinator("p1", FakeMedia::default());

        p1.on_user_connected("p2");
        p1.dial("p2").await.unwrap();
        p1.on_call("p2", CallSignal::candidate("c1")).await.unwrap();
        p1.on_call("p2", CallSignal::candidate("c2")).await.unwrap();

        assert_eq!(p1.link("p2").unwrap().pending_candidates.len(), 2);
        assert!(!p1.media().log().iter().any(|e| e.starts_with("candidate")));

        p1.on_call("p2", CallSignal::Answer { sdp: "a".into() })
            .await
            .unwrap();
        let log = p1.media().log();
        let apply = log.iter().position(|e| e == "apply:p2:a").unwrap();
        let first = log.iter().position(|e| e == "candidate:p2:c1").unwrap();
        let second = log.iter().position(|e| e == "candidate:p2:c2").unwrap();
        assert!(apply < first && first < second);
        assert!(p1.link("p2").unwrap().pending_candidates.is_empty());

        p1.on_call("p2", CallSignal::candidate("c3")).await.unwrap();
        assert!(p1.media().log().contains(&"candidate:p2:c3".to_string()));
    }

    #[tokio::test]
    async fn test_candidate_for_unknown_link_dropped() {
        let (mut p1, _outbox) = coordinator("p1", FakeMedia::default());

        p1.on_call("ghost", CallSignal::candidate("c1")).await.unwrap();
        assert!(p1.media().log().is_empty());
        assert_eq!(p1.link_count(), 0);
    }

    #[tokio::test]
    async fn test_glare_smaller_id_keeps_offer() {
        let (mut p1, p1_out) = coordinator("p1", FakeMedia::default());
        let (mut p2, p2_out) = coordinator("p2", FakeMedia::default());

        p1.on_user_ready("p2").await.unwrap();
        p2.on_user_ready("p1").await.unwrap();
        p1_out.take();
        p2_out.take();

        p1.on_call("p2", CallSignal::Offer { sdp: "offer-for-p1".into() })
            .await
            .unwrap();
        assert_eq!(p1.state_of("p2"), Some(LinkState::OfferSent));
        assert!(p1_out.take().is_empty());

        p2.on_call("p1", CallSignal::Offer { sdp: "offer-for-p2".into() })
            .await
            .unwrap();
        assert_eq!(p2.state_of("p1"), Some(LinkState::Answered));
        assert_eq!(p2_out.take().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_closes_only_that_link() {
        let media = FakeMedia {
            fail_answers: true,
            ..Default::default()
        };
        let (mut p1, _outbox) = coordinator("p1", media);

        p1.on_user_connected("p3");
        assert!(p1
            .on_call("p2", CallSignal::Offer { sdp: "o".into() })
            .await
            .is_err());

        assert_eq!(p1.state_of("p2"), None);
        assert_eq!(p1.state_of("p3"), Some(LinkState::Idle));
        assert!(p1.media().log().contains(&"close:p2".to_string()));
    }

    #[tokio::test]
    async fn test_switch_source_renegotiates_when_unsupported() {
        let (mut p1, outbox) = coordinator("p1", FakeMedia::default());

        p1.on_call("p2", CallSignal::Offer { sdp: "o".into() })
            .await
            .unwrap();
        p1.on_transport_connected("p2");
        outbox.take();

        let announce = p1.switch_source().await.unwrap();
        assert_eq!(announce, ClientEvent::stream_updated("abc", "p1"));
        assert_eq!(p1.state_of("p2"), Some(LinkState::OfferSent));
        assert!(p1.link("p2").unwrap().renegotiating);
        assert_eq!(outbox.take().len(), 1);

        p1.on_call("p2", CallSignal::Answer { sdp: "a".into() })
            .await
            .unwrap();
        assert_eq!(p1.state_of("p2"), Some(LinkState::Connected));
    }

    /// Deliver queued calls between two coordinators until both are quiet.
    async fn exchange(
        a: &mut PeerCoordinator<FakeMedia, Outbox>,
        a_out: &Outbox,
        b: &mut PeerCoordinator<FakeMedia, Outbox>,
        b_out: &Outbox,
    ) {
        loop {
            let from_a = a_out.take();
            let from_b = b_out.take();
            if from_a.is_empty() && from_b.is_empty() {
                break;
            }
            for event in from_a {
                if let ClientEvent::Call { from, signal, .. } = event {
                    b.on_call(&from, signal).await.unwrap();
                }
            }
            for event in from_b {
                if let ClientEvent::Call { from, signal, .. } = event {
                    a.on_call(&from, signal).await.unwrap();
                }
            }
        }
    }

    #[tokio::test]
    async fn test_simultaneous_renegotiation_converges() {
        let (mut p1, out1) = coordinator("p1", FakeMedia::default());
        let (mut p2, out2) = coordinator("p2", FakeMedia::default());

        p1.on_user_connected("p2");
        p1.dial("p2").await.unwrap();
        exchange(&mut p1, &out1, &mut p2, &out2).await;
        p1.on_transport_connected("p2");
        p2.on_transport_connected("p1");
        assert_eq!(p1.state_of("p2"), Some(LinkState::Connected));
        assert_eq!(p2.state_of("p1"), Some(LinkState::Connected));

        // Both sides switch sources at once
        p1.switch_source().await.unwrap();
        p2.switch_source().await.unwrap();
        exchange(&mut p1, &out1, &mut p2, &out2).await;

        assert_eq!(p1.state_of("p2"), Some(LinkState::Connected));
        assert_eq!(p2.state_of("p1"), Some(LinkState::Connected));
        assert!(!p1.link("p2").unwrap().renegotiating);
        assert!(!p2.link("p1").unwrap().renegotiating);

        // The yielding side's new source still reached the other peer
        let p1_log = p1.media().log();
        assert_eq!(
            p1_log.iter().filter(|e| *e == "answer:p2:offer-for-p1").count(),
            1
        );

        // And later switches still reach the link
        p2.switch_source().await.unwrap();
        assert_eq!(p2.media().log().last().map(String::as_str), Some("offer:p1"));
        assert_eq!(p2.state_of("p1"), Some(LinkState::OfferSent));
    }

    #[tokio::test]
    async fn test_switch_source_in_place() {
        let media = FakeMedia {
            in_place_swap: true,
            ..Default::default()
        };
        let (mut p1, outbox) = coordinator("p1", media);

        p1.on_call("p2", CallSignal::Offer { sdp: "o".into() })
            .await
            .unwrap();
        p1.on_transport_connected("p2");
        outbox.take();

        p1.switch_source().await.unwrap();
        assert_eq!(p1.state_of("p2"), Some(LinkState::Connected));
        assert!(outbox.take().is_empty());
    }

    #[tokio::test]
    async fn test_remote_offer_on_connected_link_stays_connected() {
        let (mut p2, outbox) = coordinator("p2", FakeMedia::default());

        p2.on_call("p1", CallSignal::Offer { sdp: "o".into() })
            .await
            .unwrap();
        p2.on_transport_connected("p1");
        outbox.take();

        p2.on_call("p1", CallSignal::Offer { sdp: "o2".into() })
            .await
            .unwrap();
        assert_eq!(p2.state_of("p1"), Some(LinkState::Connected));
        assert_eq!(outbox.take().len(), 1);
    }

    #[tokio::test]
    async fn test_local_presentation_only() {
        let (mut p1, outbox) = coordinator("p1", FakeMedia::default());

        p1.on_user_connected("p2");
        assert!(p1.set_remote_muted("p2", true));
        assert!(p1.set_remote_hidden("p2", true));
        assert!(!p1.set_remote_muted("ghost", true));
        assert!(p1.link("p2").unwrap().muted);
        assert!(outbox.take().is_empty());

        p1.set_track_enabled(TrackKind::Audio, false).await;
        assert_eq!(p1.media().log(), vec!["track:Audio:false".to_string()]);
    }

    #[tokio::test]
    async fn test_server_event_dispatch() {
        let (mut p1, _outbox) = coordinator("p1", FakeMedia::default());

        let followup = p1
            .on_server_event(&ServerEvent::user_connected("abc", "p2"))
            .await
            .unwrap();
        assert_eq!(
            followup,
            Followup::DialAfter {
                remote: "p2".into(),
                delay: Duration::from_secs(1)
            }
        );

        // Other rooms are ignored
        let followup = p1
            .on_server_event(&ServerEvent::user_connected("elsewhere", "p3"))
            .await
            .unwrap();
        assert_eq!(followup, Followup::None);

        let followup = p1
            .on_server_event(&ServerEvent::UserStreamUpdated {
                room: "abc".into(),
                participant: "p2".into(),
            })
            .await
            .unwrap();
        assert_eq!(
            followup,
            Followup::RefreshRemote {
                remote: "p2".into()
            }
        );

        let followup = p1
            .on_server_event(&ServerEvent::user_disconnected("abc", "p2"))
            .await
            .unwrap();
        assert_eq!(
            followup,
            Followup::Closed {
                remote: "p2".into()
            }
        );
        assert_eq!(p1.link_count(), 0);
    }
}
