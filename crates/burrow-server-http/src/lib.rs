//! Public HTTP/HTTPS ingress for the burrow relay.
//!
//! Requests are routed to tunnels by the `Host` header: `<subdomain>.<domain>`
//! resolves through the registry to an active binding, and the raw request
//! bytes are relayed over a fresh mux stream. The dispatcher never rewrites
//! headers; the tunneled target is an opaque HTTP peer. The HTTPS listener is
//! the same code path behind a TLS acceptor supplied by the certificate
//! layer.

mod server;

pub use server::{HttpIngress, HttpIngressError};
