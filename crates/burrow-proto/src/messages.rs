//! Protocol message types

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Codec errors. Every variant maps onto the `INVALID_MESSAGE` wire code;
/// callers decide whether a failure is recoverable for the session.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed control message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("missing required payload field: {0}")]
    MissingField(&'static str),

    #[error("invalid payload field: {0}")]
    InvalidField(&'static str),
}

/// Stable error codes carried in `error` message payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidMessage,
    InvalidToken,
    AuthFailed,
    InvalidRequest,
    SubdomainTaken,
    PortAllocationFailed,
    RegistrationFailed,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
            ErrorCode::InvalidToken => "INVALID_TOKEN",
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::SubdomainTaken => "SUBDOMAIN_TAKEN",
            ErrorCode::PortAllocationFailed => "PORT_ALLOCATION_FAILED",
            ErrorCode::RegistrationFailed => "REGISTRATION_FAILED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message type discriminator of the control envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Auth,
    AuthResponse,
    TunnelRequest,
    TunnelResponse,
    TcpRequest,
    TcpResponse,
    GrpcRequest,
    GrpcResponse,
    NewConnection,
    CloseConnection,
    Heartbeat,
    Error,
}

/// Tunnel protocols a client may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelProtocol {
    Http,
    Https,
    Tcp,
    Grpc,
}

impl TunnelProtocol {
    /// Parse a protocol literal, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Some(TunnelProtocol::Http),
            "https" => Some(TunnelProtocol::Https),
            "tcp" => Some(TunnelProtocol::Tcp),
            "grpc" => Some(TunnelProtocol::Grpc),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelProtocol::Http => "http",
            TunnelProtocol::Https => "https",
            TunnelProtocol::Tcp => "tcp",
            TunnelProtocol::Grpc => "grpc",
        }
    }

    /// HTTP-family tunnels get a public URL; the rest get a public port.
    pub fn uses_subdomain_routing(&self) -> bool {
        matches!(self, TunnelProtocol::Http | TunnelProtocol::Https)
    }
}

impl std::fmt::Display for TunnelProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A control-channel message. `payload` is a free-form JSON mapping whose
/// recognized keys depend on `msg_type`; the typed views below extract and
/// validate them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub request_id: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    pub timestamp: i64,
}

impl ControlMessage {
    pub fn new(msg_type: MessageType, request_id: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            msg_type,
            request_id: request_id.into(),
            payload,
            timestamp: Utc::now().timestamp(),
        }
    }

    /// Build an `error` message with the given code.
    pub fn error(request_id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        let mut payload = Map::new();
        payload.insert("code".into(), json!(code.as_str()));
        payload.insert("message".into(), json!(message.into()));
        Self::new(MessageType::Error, request_id, payload)
    }

    /// Build a `heartbeat` reply carrying the current timestamp.
    pub fn heartbeat(request_id: impl Into<String>) -> Self {
        let mut payload = Map::new();
        payload.insert("timestamp".into(), json!(Utc::now().timestamp()));
        Self::new(MessageType::Heartbeat, request_id, payload)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

fn required_str(payload: &Map<String, Value>, key: &'static str) -> Result<String, ProtocolError> {
    match payload.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::String(_)) | None => Err(ProtocolError::MissingField(key)),
        Some(_) => Err(ProtocolError::InvalidField(key)),
    }
}

fn optional_str(payload: &Map<String, Value>, key: &'static str) -> Result<Option<String>, ProtocolError> {
    match payload.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(Some(s.clone())),
        Some(Value::String(_)) | Some(Value::Null) | None => Ok(None),
        Some(_) => Err(ProtocolError::InvalidField(key)),
    }
}

fn port_value(value: &Value, key: &'static str) -> Result<u16, ProtocolError> {
    value
        .as_u64()
        .filter(|p| (1..=u64::from(u16::MAX)).contains(p))
        .map(|p| p as u16)
        .ok_or(ProtocolError::InvalidField(key))
}

/// `auth` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthRequest {
    pub token: String,
}

impl AuthRequest {
    pub fn from_payload(payload: &Map<String, Value>) -> Result<Self, ProtocolError> {
        Ok(Self {
            token: required_str(payload, "token")?,
        })
    }

    pub fn into_message(self, request_id: impl Into<String>) -> ControlMessage {
        let mut payload = Map::new();
        payload.insert("token".into(), json!(self.token));
        ControlMessage::new(MessageType::Auth, request_id, payload)
    }
}

/// `auth_response` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthResponse {
    pub success: bool,
    pub client_id: Option<String>,
    pub message: Option<String>,
}

impl AuthResponse {
    pub fn granted(client_id: impl Into<String>) -> Self {
        Self {
            success: true,
            client_id: Some(client_id.into()),
            message: None,
        }
    }

    pub fn from_payload(payload: &Map<String, Value>) -> Result<Self, ProtocolError> {
        let success = payload
            .get("success")
            .and_then(Value::as_bool)
            .ok_or(ProtocolError::MissingField("success"))?;
        Ok(Self {
            success,
            client_id: optional_str(payload, "client_id")?,
            message: optional_str(payload, "message")?,
        })
    }

    pub fn into_message(self, request_id: impl Into<String>) -> ControlMessage {
        let mut payload = Map::new();
        payload.insert("success".into(), json!(self.success));
        if let Some(client_id) = self.client_id {
            payload.insert("client_id".into(), json!(client_id));
        }
        if let Some(message) = self.message {
            payload.insert("message".into(), json!(message));
        }
        ControlMessage::new(MessageType::AuthResponse, request_id, payload)
    }
}

/// Validated tunnel request, shared by `tunnel_request`, `tcp_request` and
/// `grpc_request`. For the latter two the protocol is implied by the message
/// type; `tunnel_request` must carry an HTTP-family protocol literal.
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelRequest {
    pub subdomain: String,
    pub protocol: TunnelProtocol,
    pub local_port: u16,
    pub local_host: String,
    pub public_port: Option<u16>,
    pub services: Vec<String>,
    pub max_streams: Option<u32>,
}

impl TunnelRequest {
    pub fn from_message(msg: &ControlMessage) -> Result<Self, ProtocolError> {
        let payload = &msg.payload;
        let subdomain = required_str(payload, "subdomain")?;

        let protocol = match msg.msg_type {
            MessageType::TcpRequest => TunnelProtocol::Tcp,
            MessageType::GrpcRequest => TunnelProtocol::Grpc,
            _ => {
                let literal = required_str(payload, "protocol")?;
                TunnelProtocol::parse(&literal).ok_or(ProtocolError::InvalidField("protocol"))?
            }
        };

        let local_port = payload
            .get("local_port")
            .ok_or(ProtocolError::MissingField("local_port"))
            .and_then(|v| port_value(v, "local_port"))?;

        let local_host = optional_str(payload, "local_host")?.unwrap_or_else(|| "localhost".to_string());

        let public_port = match payload.get("public_port") {
            Some(Value::Null) | None => None,
            Some(v) => Some(port_value(v, "public_port")?),
        };

        let services = match payload.get("services") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(str::to_string)
                        .ok_or(ProtocolError::InvalidField("services"))
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(Value::Null) | None => Vec::new(),
            Some(_) => return Err(ProtocolError::InvalidField("services")),
        };

        let max_streams = match payload.get("max_streams") {
            Some(Value::Null) | None => None,
            Some(v) => Some(
                v.as_u64()
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or(ProtocolError::InvalidField("max_streams"))?,
            ),
        };

        Ok(Self {
            subdomain,
            protocol,
            local_port,
            local_host,
            public_port,
            services,
            max_streams,
        })
    }

    /// Response message type matching this request's protocol.
    pub fn response_type(&self) -> MessageType {
        match self.protocol {
            TunnelProtocol::Tcp => MessageType::TcpResponse,
            TunnelProtocol::Grpc => MessageType::GrpcResponse,
            _ => MessageType::TunnelResponse,
        }
    }

    pub fn into_message(self, request_id: impl Into<String>) -> ControlMessage {
        let msg_type = match self.protocol {
            TunnelProtocol::Tcp => MessageType::TcpRequest,
            TunnelProtocol::Grpc => MessageType::GrpcRequest,
            _ => MessageType::TunnelRequest,
        };
        let mut payload = Map::new();
        payload.insert("subdomain".into(), json!(self.subdomain));
        if msg_type == MessageType::TunnelRequest {
            payload.insert("protocol".into(), json!(self.protocol.as_str()));
        }
        payload.insert("local_port".into(), json!(self.local_port));
        payload.insert("local_host".into(), json!(self.local_host));
        if let Some(port) = self.public_port {
            payload.insert("public_port".into(), json!(port));
        }
        if !self.services.is_empty() {
            payload.insert("services".into(), json!(self.services));
        }
        if let Some(max) = self.max_streams {
            payload.insert("max_streams".into(), json!(max));
        }
        ControlMessage::new(msg_type, request_id, payload)
    }
}

/// `tunnel_response` / `tcp_response` / `grpc_response` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelAccepted {
    pub tunnel_id: String,
    pub public_url: Option<String>,
    pub public_port: Option<u16>,
}

impl TunnelAccepted {
    pub fn from_payload(payload: &Map<String, Value>) -> Result<Self, ProtocolError> {
        let tunnel_id = required_str(payload, "tunnel_id")?;
        let public_port = match payload.get("public_port") {
            Some(Value::Null) | None => None,
            Some(v) => Some(port_value(v, "public_port")?),
        };
        Ok(Self {
            tunnel_id,
            public_url: optional_str(payload, "public_url")?,
            public_port,
        })
    }

    pub fn into_message(self, msg_type: MessageType, request_id: impl Into<String>) -> ControlMessage {
        let mut payload = Map::new();
        payload.insert("tunnel_id".into(), json!(self.tunnel_id));
        payload.insert("status".into(), json!("active"));
        if let Some(url) = self.public_url {
            payload.insert("public_url".into(), json!(url));
        }
        if let Some(port) = self.public_port {
            payload.insert("public_port".into(), json!(port));
        }
        ControlMessage::new(msg_type, request_id, payload)
    }
}

/// `new_connection` payload directing the client to dial the mux listener.
#[derive(Debug, Clone, PartialEq)]
pub struct MuxEstablish {
    pub tunnel_id: String,
    pub mux_port: u16,
    pub mux_addr: String,
}

impl MuxEstablish {
    pub const ACTION: &'static str = "establish_mux";

    pub fn from_payload(payload: &Map<String, Value>) -> Result<Self, ProtocolError> {
        let action = required_str(payload, "action")?;
        if action != Self::ACTION {
            return Err(ProtocolError::InvalidField("action"));
        }
        let mux_port = payload
            .get("mux_port")
            .ok_or(ProtocolError::MissingField("mux_port"))
            .and_then(|v| port_value(v, "mux_port"))?;
        Ok(Self {
            tunnel_id: required_str(payload, "tunnel_id")?,
            mux_port,
            mux_addr: required_str(payload, "mux_addr")?,
        })
    }

    pub fn into_message(self, request_id: impl Into<String>) -> ControlMessage {
        let mut payload = Map::new();
        payload.insert("action".into(), json!(Self::ACTION));
        payload.insert("tunnel_id".into(), json!(self.tunnel_id));
        payload.insert("mux_port".into(), json!(self.mux_port));
        payload.insert("mux_addr".into(), json!(self.mux_addr));
        ControlMessage::new(MessageType::NewConnection, request_id, payload)
    }
}

/// `close_connection` payload: an explicit tunnel close.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseRequest {
    pub tunnel_id: String,
}

impl CloseRequest {
    pub fn from_payload(payload: &Map<String, Value>) -> Result<Self, ProtocolError> {
        Ok(Self {
            tunnel_id: required_str(payload, "tunnel_id")?,
        })
    }

    pub fn into_message(self, request_id: impl Into<String>) -> ControlMessage {
        let mut payload = Map::new();
        payload.insert("tunnel_id".into(), json!(self.tunnel_id));
        ControlMessage::new(MessageType::CloseConnection, request_id, payload)
    }
}

/// `error` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    pub details: Option<Map<String, Value>>,
}

impl ErrorPayload {
    pub fn from_payload(payload: &Map<String, Value>) -> Result<Self, ProtocolError> {
        let details = match payload.get("details") {
            Some(Value::Object(map)) => Some(map.clone()),
            Some(Value::Null) | None => None,
            Some(_) => return Err(ProtocolError::InvalidField("details")),
        };
        Ok(Self {
            code: required_str(payload, "code")?,
            message: required_str(payload, "message")?,
            details,
        })
    }
}
