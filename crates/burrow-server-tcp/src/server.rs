//! Port-range TCP ingress

use burrow_router::TunnelRegistry;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum TcpIngressError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind port {port}: {reason}")]
    BindError { port: u16, reason: String },
}

/// Forwards raw TCP connections to tunnels registered by public port.
pub struct TcpIngress {
    registry: Arc<TunnelRegistry>,
}

impl TcpIngress {
    pub fn new(registry: Arc<TunnelRegistry>) -> Self {
        Self { registry }
    }

    /// Bind every port in the inclusive range and spawn one accept loop
    /// per listener. Binding happens up front so a busy port fails fast.
    pub async fn start(&self, start: u16, end: u16) -> Result<(), TcpIngressError> {
        for port in start..=end {
            let listener = TcpListener::bind(("0.0.0.0", port))
                .await
                .map_err(|e| TcpIngressError::BindError {
                    port,
                    reason: e.to_string(),
                })?;
            let registry = self.registry.clone();
            tokio::spawn(async move {
                listen_on_port(listener, registry, port).await;
            });
        }
        info!("tcp ingress listening on ports {}-{}", start, end);
        Ok(())
    }
}

async fn listen_on_port(listener: TcpListener, registry: Arc<TunnelRegistry>, port: u16) {
    loop {
        match listener.accept().await {
            Ok((socket, peer_addr)) => {
                debug!(%peer_addr, port, "accepted tcp connection");
                let registry = registry.clone();
                tokio::spawn(async move {
                    handle_connection(socket, registry, port).await;
                });
            }
            Err(e) => {
                error!(port, "tcp accept error: {}", e);
            }
        }
    }
}

/// Pipe one public connection through the tunnel bound to `port`. A
/// connection to a port with no binding is silently closed. Either side
/// closing propagates to the other.
async fn handle_connection(mut socket: TcpStream, registry: Arc<TunnelRegistry>, port: u16) {
    let Some(binding) = registry.get_by_port(port) else {
        debug!(port, "no tunnel registered on port");
        return;
    };

    let mut stream = match binding.open_stream().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(port, subdomain = %binding.subdomain, "failed to open stream: {}", e);
            return;
        }
    };

    debug!(port, subdomain = %binding.subdomain, "forwarding tcp connection");
    match tokio::io::copy_bidirectional(&mut socket, &mut stream).await {
        Ok((to_tunnel, from_tunnel)) => {
            debug!(
                port,
                subdomain = %binding.subdomain,
                to_tunnel,
                from_tunnel,
                "tcp connection finished"
            );
        }
        Err(e) => {
            debug!(port, "tcp forwarding ended: {}", e);
        }
    }
}
