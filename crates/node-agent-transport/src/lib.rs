//! Command-and-control WebSocket transport client (§4.E): connection,
//! session-token auth, registration handshake, heartbeats, reconnect, and
//! inbound/outbound frame schema validation and log sanitisation.

pub mod client;
pub mod sanitize;
pub mod schema;
pub mod session;

pub use client::{CncClient, TransportEvent};
pub use sanitize::sanitize;
pub use schema::{InboundFrame, OutboundFrame};
pub use session::SessionManager;
