//! Yamux session ownership for tunnel data transfer.
//!
//! Each active tunnel owns exactly one [`MuxSession`] wrapping a single TCP
//! connection dialed by the client. The relay side runs in server mode and
//! opens one stream per inbound public connection; the client side accepts
//! those streams and forwards them to the local service. The wire format is
//! the yamux protocol, so clients built on the Go implementation
//! interoperate unchanged.

mod session;

pub use session::{MuxError, MuxSession, MuxStream};
