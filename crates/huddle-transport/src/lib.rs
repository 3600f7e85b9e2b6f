//! # huddle-transport
//!
//! Connection plumbing for the Huddle signaling hub.
//!
//! - [`ConnectionId`] names a live socket, independent of the participant
//!   identity announced over it.
//! - [`EventSink`] is the non-blocking outbound half the relay delivers into.
//! - [`SignalClient`] is a reconnecting WebSocket client that restores its
//!   room memberships after every reconnect.
//!
//! ```rust,ignore
//! use huddle_transport::{ClientConfig, SignalClient};
//!
//! let (client, mut notices, _task) = SignalClient::spawn(ClientConfig::default());
//! client.join_room("abc", "p1")?;
//! while let Some(notice) = notices.recv().await {
//!     // React to server events
//! }
//! ```

pub mod sink;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use sink::ChannelSink;
pub use traits::{ConnectionId, EventSink, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{ClientConfig, ClientNotice, Memberships, SignalClient};
