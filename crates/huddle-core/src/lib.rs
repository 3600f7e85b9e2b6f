//! # huddle-core
//!
//! Real-time session layer of the Huddle social app.
//!
//! This crate provides the building blocks the server and clients share:
//!
//! - **Registry** - Which participants are in which room, on which connection
//! - **Relay** - Room-scoped fan-out of presence, typing and call signals
//! - **Negotiation** - Client-side offer/answer/candidate state machine
//! - **Notify** - Pending friend requests and unread conversations, on demand
//! - **Fanout** - Persist-then-relay for chat messages
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌──────────────┐
//! │  Connection │────▶│    Relay    │────▶│ RoomRegistry │
//! └─────────────┘     └─────────────┘     └──────────────┘
//!                        ▲       ▲
//!          ┌─────────────┘       └─────────────┐
//!   ┌──────────────┐                   ┌──────────────┐
//!   │  ChatFanout  │                   │ Notification │
//!   └──────────────┘                   │  Aggregator  │
//!          │                           └──────────────┘
//!          ▼                                   │
//!   ┌──────────────┐                           │
//!   │    Store     │◀──────────────────────────┘
//!   └──────────────┘
//! ```

pub mod fanout;
pub mod memory;
pub mod negotiation;
pub mod notify;
pub mod registry;
pub mod relay;
pub mod store;

pub use fanout::{ChatFanout, FanoutError};
pub use memory::MemoryStore;
pub use negotiation::{
    CallSignaler, Followup, LinkState, MediaSession, NegotiationError, NegotiatorConfig,
    PeerCoordinator, PeerLink, TrackKind,
};
pub use notify::{NotificationAggregator, Notifications, NotifyError};
pub use registry::{
    Departure, JoinOutcome, Member, ParticipantId, RegistryConfig, RegistryError, RoomId,
    RoomRegistry, Visibility,
};
pub use relay::{Delivery, Relay, RelayError};
pub use store::{
    ChatMessage, Conversation, ConversationKind, FriendRequest, MessageDraft, RequestStatus,
    Store, StoreError, User,
};
