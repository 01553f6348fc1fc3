//! Tunnel routing state for the burrow relay.
//!
//! The registry is the source of truth for routing: ingress dispatchers
//! resolve inbound traffic to a [`TunnelBinding`] by subdomain or public
//! port and borrow its mux session to open a data stream. Control sessions
//! are the only writers. Durable records live in the repository; bindings
//! here exist only while their control connection is up.

mod allocator;
mod registry;

pub use allocator::{PortAllocError, PortAllocator};
pub use registry::{RegistryError, TunnelBinding, TunnelRegistry};
