//! Control plane of the burrow relay.
//!
//! One long-lived WebSocket per client carries JSON control messages:
//! authentication, tunnel provisioning, heartbeats, and the `new_connection`
//! handshake that upgrades a tunnel to an active yamux session. Each
//! connection is served by its own task; the outbound half is serialized
//! through a writer task so the session and the mux-establishment task
//! never interleave frames.

mod broker;
mod channel;
mod session;

pub use channel::{ChannelClosed, ControlChannel};
pub use session::{ControlServer, SessionConfig};
