//! # huddle-protocol
//!
//! Wire protocol definitions for the Huddle signaling relay.
//!
//! This crate defines the events exchanged between browser clients and the
//! relay, and the codecs used to put them on a WebSocket.
//!
//! ## Event Families
//!
//! - `join-room` / `leave-room` / `subscribe` - Room membership
//! - `stream-updated` / `typing` / `peer-ready` - Relayed room signals
//! - `call` - Point-to-point offer/answer/candidate exchange
//! - `new-message` / `friend-request-received` - Server pushes
//!
//! ## Example
//!
//! ```rust
//! use huddle_protocol::{codec, ClientEvent};
//!
//! let event = ClientEvent::join_room("abc", "peer-1");
//!
//! let text = codec::encode_json(&event).unwrap();
//! let decoded: ClientEvent = codec::decode_json(&text).unwrap();
//! assert_eq!(event, decoded);
//! ```

pub mod codec;
pub mod events;

pub use codec::{decode, encode, ProtocolError, WireFormat};
pub use events::{
    error_codes, Attachment, CallSignal, ChatEnvelope, ClientEvent, EventKind, SenderInfo,
    ServerEvent, PROTOCOL_VERSION,
};
