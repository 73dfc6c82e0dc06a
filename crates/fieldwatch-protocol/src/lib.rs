//! # fieldwatch-protocol
//!
//! Wire protocol definitions for the fieldwatch telemetry hub.
//!
//! Clients exchange event envelopes with the hub over WebSocket. This crate
//! defines the inbound and outbound event types, boundary validation, and the
//! JSON / MessagePack codecs.
//!
//! ## Events
//!
//! - `join` / `telemetry` / `location_ping` - sent by clients
//! - `enumerator_online` / `enumerator_offline` - presence, sent by the hub
//! - `live_update` / `location_update` - mirrored enumerator data
//!
//! ## Example
//!
//! ```rust
//! use fieldwatch_protocol::{codec, ClientEvent, Role};
//!
//! let event = ClientEvent::join("E1", "P1", Role::Enumerator);
//!
//! let text = codec::to_json(&event).unwrap();
//! let decoded = codec::decode_client_text(&text).unwrap();
//! assert_eq!(event, decoded);
//! ```

pub mod codec;
pub mod events;
pub mod version;

pub use codec::{decode, encode, ProtocolError, WireFormat};
pub use events::{ClientEvent, EventKind, Location, Role, ServerEvent, SessionStatus};
pub use version::{Version, PROTOCOL_VERSION};
