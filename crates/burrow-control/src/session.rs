//! Per-client control sessions

use crate::broker;
use crate::channel::{ChannelClosed, ControlChannel};
use burrow_proto::{
    AuthRequest, AuthResponse, CloseRequest, ControlMessage, ErrorCode, MessageType, ProtocolError,
    TunnelAccepted, TunnelRequest,
};
use burrow_relay_db::{Client, Repository, Tunnel, TunnelStatus};
use burrow_router::{PortAllocator, TunnelBinding, TunnelRegistry};
use chrono::Utc;
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Session timing and addressing knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Public apex domain; tunnels live under `<subdomain>.<domain>`.
    pub domain: String,
    /// Deadline for the initial `auth` message.
    pub auth_timeout: Duration,
    /// Idle window for an authenticated session. Heartbeats reset it; a
    /// silent client past this window is treated as gone.
    pub idle_timeout: Duration,
    /// Deadline for the client to dial the ephemeral mux listener.
    pub mux_accept_timeout: Duration,
}

impl SessionConfig {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            auth_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            mux_accept_timeout: Duration::from_secs(30),
        }
    }
}

/// Accepts control connections and runs one session task per client.
pub struct ControlServer {
    registry: Arc<TunnelRegistry>,
    repo: Arc<dyn Repository>,
    allocator: Option<Arc<PortAllocator>>,
    config: SessionConfig,
}

impl ControlServer {
    pub fn new(
        registry: Arc<TunnelRegistry>,
        repo: Arc<dyn Repository>,
        allocator: Option<Arc<PortAllocator>>,
        config: SessionConfig,
    ) -> Self {
        Self {
            registry,
            repo,
            allocator,
            config,
        }
    }

    /// Accept loop. Runs until the listener fails.
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_connection(socket, peer_addr).await;
                    });
                }
                Err(e) => {
                    error!("control listener accept error: {}", e);
                }
            }
        }
    }

    /// Serve one control connection to completion.
    pub async fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        debug!(%peer_addr, "incoming control connection");

        let ws = match tokio_tungstenite::accept_async(socket).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(%peer_addr, "websocket handshake failed: {}", e);
                return;
            }
        };
        let (sink, mut source) = ws.split();
        let channel = ControlChannel::start(sink);

        let Some(client) = self.authenticate(&channel, &mut source).await else {
            return;
        };
        info!(client_id = %client.id, %peer_addr, "client authenticated");

        self.serve_client(&channel, &mut source, &client).await;

        self.cleanup_client(&client.id).await;
        info!(client_id = %client.id, "client disconnected");
    }

    /// First message must be `auth` within the deadline; the token is looked
    /// up in the repository. Any failure ends the connection.
    async fn authenticate(&self, channel: &ControlChannel, source: &mut WsSource) -> Option<Client> {
        let msg = match timeout(self.config.auth_timeout, read_message(source)).await {
            Err(_) => {
                debug!("authentication deadline expired");
                return None;
            }
            Ok(None) => return None,
            Ok(Some(Err(e))) => {
                let _ = channel
                    .send(ControlMessage::error("", ErrorCode::InvalidMessage, e.to_string()))
                    .await;
                return None;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        if msg.msg_type != MessageType::Auth {
            let _ = channel
                .send(ControlMessage::error(
                    msg.request_id,
                    ErrorCode::InvalidMessage,
                    "expected auth message",
                ))
                .await;
            return None;
        }

        let auth = match AuthRequest::from_payload(&msg.payload) {
            Ok(auth) => auth,
            Err(_) => {
                let _ = channel
                    .send(ControlMessage::error(
                        msg.request_id,
                        ErrorCode::InvalidToken,
                        "token is required",
                    ))
                    .await;
                return None;
            }
        };

        let client = match self.repo.get_client_by_token(&auth.token).await {
            Ok(Some(client)) => client,
            Ok(None) => {
                let _ = channel
                    .send(ControlMessage::error(
                        msg.request_id,
                        ErrorCode::AuthFailed,
                        "invalid token",
                    ))
                    .await;
                return None;
            }
            Err(e) => {
                error!("client lookup failed: {}", e);
                let _ = channel
                    .send(ControlMessage::error(
                        msg.request_id,
                        ErrorCode::AuthFailed,
                        "authentication failed",
                    ))
                    .await;
                return None;
            }
        };

        let response = AuthResponse::granted(client.id.clone()).into_message(msg.request_id);
        channel.send(response).await.ok()?;
        Some(client)
    }

    /// Authenticated request loop. Returns when the connection dies, the
    /// idle window lapses, or a response can no longer be sent.
    async fn serve_client(&self, channel: &ControlChannel, source: &mut WsSource, client: &Client) {
        loop {
            let msg = match timeout(self.config.idle_timeout, read_message(source)).await {
                Err(_) => {
                    warn!(client_id = %client.id, "control connection idle, assuming dead");
                    return;
                }
                Ok(None) => return,
                Ok(Some(Err(e))) => {
                    // Validation failures are answered, not fatal.
                    if channel
                        .send(ControlMessage::error("", ErrorCode::InvalidMessage, e.to_string()))
                        .await
                        .is_err()
                    {
                        return;
                    }
                    continue;
                }
                Ok(Some(Ok(msg))) => msg,
            };

            let outcome = match msg.msg_type {
                MessageType::TunnelRequest | MessageType::TcpRequest | MessageType::GrpcRequest => {
                    self.provision_tunnel(channel, client, &msg).await
                }
                MessageType::Heartbeat => channel.send(ControlMessage::heartbeat(msg.request_id)).await,
                MessageType::CloseConnection => {
                    self.handle_close(channel, client, &msg).await
                }
                other => {
                    debug!(client_id = %client.id, "unexpected message type: {:?}", other);
                    channel
                        .send(ControlMessage::error(
                            msg.request_id,
                            ErrorCode::InvalidMessage,
                            format!("unexpected message type: {other:?}"),
                        ))
                        .await
                }
            };

            if outcome.is_err() {
                return;
            }
        }
    }

    /// Provision one tunnel. Every failure leaves no partial state: the
    /// repository row and the registry binding are created and rolled back
    /// as a pair, and the response send is part of the transaction.
    async fn provision_tunnel(
        &self,
        channel: &ControlChannel,
        client: &Client,
        msg: &ControlMessage,
    ) -> Result<(), ChannelClosed> {
        let request = match TunnelRequest::from_message(msg) {
            Ok(request) => request,
            Err(e) => {
                return channel
                    .send(ControlMessage::error(
                        &msg.request_id,
                        ErrorCode::InvalidMessage,
                        e.to_string(),
                    ))
                    .await;
            }
        };

        // `tunnel_request` is the HTTP-family request; TCP and gRPC have
        // dedicated message types.
        if msg.msg_type == MessageType::TunnelRequest && !request.protocol.uses_subdomain_routing() {
            return channel
                .send(ControlMessage::error(
                    &msg.request_id,
                    ErrorCode::InvalidRequest,
                    format!("protocol {} requires a tcp_request or grpc_request", request.protocol),
                ))
                .await;
        }

        if !client.may_use_subdomain(&request.subdomain) {
            return channel
                .send(ControlMessage::error(
                    &msg.request_id,
                    ErrorCode::InvalidRequest,
                    format!("subdomain {} is not permitted for this client", request.subdomain),
                ))
                .await;
        }

        match self.repo.get_tunnel_by_subdomain(&request.subdomain).await {
            Ok(None) => {}
            Ok(Some(_)) => {
                return channel
                    .send(ControlMessage::error(
                        &msg.request_id,
                        ErrorCode::SubdomainTaken,
                        format!("subdomain {} is already in use", request.subdomain),
                    ))
                    .await;
            }
            Err(e) => {
                error!("subdomain lookup failed: {}", e);
                return channel
                    .send(ControlMessage::error(
                        &msg.request_id,
                        ErrorCode::InternalError,
                        "failed to create tunnel",
                    ))
                    .await;
            }
        }

        let tunnel_id = Uuid::new_v4().to_string();

        let (public_url, public_port) = if request.protocol.uses_subdomain_routing() {
            (
                Some(format!("https://{}.{}", request.subdomain, self.config.domain)),
                None,
            )
        } else {
            let Some(allocator) = &self.allocator else {
                return channel
                    .send(ControlMessage::error(
                        &msg.request_id,
                        ErrorCode::PortAllocationFailed,
                        "tcp tunneling not enabled",
                    ))
                    .await;
            };
            match allocator.claim(request.public_port, &self.registry) {
                Ok(port) => (None, Some(port)),
                Err(e) => {
                    return channel
                        .send(ControlMessage::error(
                            &msg.request_id,
                            ErrorCode::PortAllocationFailed,
                            e.to_string(),
                        ))
                        .await;
                }
            }
        };

        let tunnel = Tunnel {
            id: tunnel_id.clone(),
            client_id: client.id.clone(),
            subdomain: request.subdomain.clone(),
            protocol: request.protocol,
            local_host: request.local_host.clone(),
            local_port: request.local_port,
            public_url: public_url.clone(),
            public_port,
            created_at: Utc::now(),
            closed_at: None,
            status: TunnelStatus::Active,
        };
        if let Err(e) = self.repo.create_tunnel(&tunnel).await {
            error!("failed to persist tunnel: {}", e);
            return channel
                .send(ControlMessage::error(
                    &msg.request_id,
                    ErrorCode::InternalError,
                    "failed to create tunnel",
                ))
                .await;
        }

        let mut binding = TunnelBinding::new(
            tunnel_id.clone(),
            client.id.clone(),
            request.subdomain.clone(),
            request.protocol,
            request.local_host.clone(),
            request.local_port,
            public_url.clone(),
            public_port,
            channel.sender(),
        );
        binding.grpc_services = request.services.clone();
        binding.max_streams = request.max_streams;

        let binding = match self.registry.register(binding) {
            Ok(binding) => binding,
            Err(e) => {
                // Lost a race between the repository check and the index
                // insert; roll the row back.
                if let Err(close_err) = self.repo.close_tunnel(&tunnel_id).await {
                    error!("rollback of tunnel {} failed: {}", tunnel_id, close_err);
                }
                return channel
                    .send(ControlMessage::error(
                        &msg.request_id,
                        ErrorCode::RegistrationFailed,
                        e.to_string(),
                    ))
                    .await;
            }
        };

        let response = TunnelAccepted {
            tunnel_id: tunnel_id.clone(),
            public_url: public_url.clone(),
            public_port,
        }
        .into_message(request.response_type(), &msg.request_id);

        if channel.send(response).await.is_err() {
            self.registry.unregister(&request.subdomain).await;
            if let Err(e) = self.repo.close_tunnel(&tunnel_id).await {
                error!("rollback of tunnel {} failed: {}", tunnel_id, e);
            }
            return Err(ChannelClosed);
        }

        broker::spawn_establish(
            self.registry.clone(),
            self.repo.clone(),
            binding,
            self.config.mux_accept_timeout,
        );

        match public_port {
            Some(port) => info!(
                client_id = %client.id,
                subdomain = %request.subdomain,
                port,
                "tunnel created"
            ),
            None => info!(
                client_id = %client.id,
                subdomain = %request.subdomain,
                url = public_url.as_deref().unwrap_or_default(),
                "tunnel created"
            ),
        }

        Ok(())
    }

    /// Explicit close of one tunnel owned by the caller. Idempotent.
    async fn handle_close(
        &self,
        channel: &ControlChannel,
        client: &Client,
        msg: &ControlMessage,
    ) -> Result<(), ChannelClosed> {
        let close = match CloseRequest::from_payload(&msg.payload) {
            Ok(close) => close,
            Err(e) => {
                return channel
                    .send(ControlMessage::error(
                        &msg.request_id,
                        ErrorCode::InvalidMessage,
                        e.to_string(),
                    ))
                    .await;
            }
        };

        let owned = self.registry.get_by_client(&client.id);
        match owned.into_iter().find(|b| b.id == close.tunnel_id) {
            Some(binding) => {
                self.registry.unregister(&binding.subdomain).await;
                if let Err(e) = self.repo.close_tunnel(&binding.id).await {
                    error!("failed to close tunnel record {}: {}", binding.id, e);
                }
                info!(
                    client_id = %client.id,
                    subdomain = %binding.subdomain,
                    "tunnel closed by client"
                );
            }
            None => {
                debug!(
                    client_id = %client.id,
                    tunnel_id = %close.tunnel_id,
                    "close for unknown tunnel ignored"
                );
            }
        }
        Ok(())
    }

    /// Tear down everything the client owns: registry bindings (which
    /// closes mux sessions) and repository rows. Idempotent.
    pub async fn cleanup_client(&self, client_id: &str) {
        for binding in self.registry.get_by_client(client_id) {
            self.registry.unregister(&binding.subdomain).await;
            if let Err(e) = self.repo.close_tunnel(&binding.id).await {
                error!("failed to close tunnel record {}: {}", binding.id, e);
            }
            info!(client_id, subdomain = %binding.subdomain, "cleaned up tunnel");
        }
    }
}

/// Read the next JSON control message, skipping transport frames. `None`
/// means the connection is gone; a decode error is recoverable.
async fn read_message(source: &mut WsSource) -> Option<Result<ControlMessage, ProtocolError>> {
    loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => return Some(ControlMessage::decode(&text)),
            Some(Ok(Message::Binary(data))) => {
                return Some(ControlMessage::decode(&String::from_utf8_lossy(&data)));
            }
            Some(Ok(Message::Close(_))) => return None,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!("control connection read error: {}", e);
                return None;
            }
            None => return None,
        }
    }
}
