//! # fieldwatch-core
//!
//! Session registry and room-scoped broadcast hub for the fieldwatch
//! telemetry relay.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Hub** - Connection lifecycle, event handling and fan-out
//! - **Room** - The set of connections joined to a project
//! - **SessionRegistry** - Live enumerator sessions keyed by identity
//! - **ConnectionId** - Transport connection handles
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  events   ┌─────────────┐  fan-out  ┌─────────────┐
//! │  Transport  │──────────▶│     Hub     │──────────▶│    Rooms    │
//! └─────────────┘           └─────────────┘           └─────────────┘
//!                                  │
//!                                  ▼
//!                           ┌─────────────┐
//!                           │  Sessions   │
//!                           └─────────────┘
//! ```

pub mod connection;
pub mod hub;
pub mod room;
pub mod session;

pub use connection::ConnectionId;
pub use hub::{
    ConnectionState, Departure, FanoutReport, Hub, HubConfig, HubError, HubStats, Outbound,
};
pub use room::{ProjectId, Room};
pub use session::{now_millis, Session, SessionRegistry};
