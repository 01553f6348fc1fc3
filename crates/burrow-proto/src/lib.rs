//! Control protocol for the burrow relay.
//!
//! The control channel carries JSON messages over a long-lived WebSocket
//! connection. Each message is an envelope `{type, request_id, payload,
//! timestamp}` where the recognized payload fields depend on the type.
//! Tunneled data never travels over the control channel; it flows through
//! yamux streams negotiated via `new_connection` messages.

mod messages;

pub use messages::{
    AuthRequest, AuthResponse, CloseRequest, ControlMessage, ErrorCode, ErrorPayload,
    MessageType, MuxEstablish, ProtocolError, TunnelAccepted, TunnelProtocol, TunnelRequest,
};
