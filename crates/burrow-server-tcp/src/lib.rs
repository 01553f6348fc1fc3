//! Raw TCP ingress for the burrow relay.
//!
//! One listener task per port in the configured range. An accepted
//! connection is matched to a tunnel by its local port and becomes a plain
//! byte pipe to a fresh mux stream; no framing is imposed, so gRPC and any
//! other TCP protocol flow identically.

mod server;

pub use server::{TcpIngress, TcpIngressError};
