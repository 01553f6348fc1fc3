//! Relay wiring
//!
//! Startup order: sweep stale repository rows, build the shared registry
//! and allocator, bind every listener, then spawn the accept loops. Bind
//! failures surface before `start` returns; after that the relay runs until
//! the handle is shut down or the process exits.

use crate::config::{ConfigError, RelayConfig};
use crate::tls::{build_acceptor, TlsError};
use burrow_control::{ControlServer, SessionConfig};
use burrow_relay_db::{Repository, StorageError};
use burrow_router::{PortAllocError, PortAllocator, TunnelRegistry};
use burrow_server_http::HttpIngress;
use burrow_server_tcp::{TcpIngress, TcpIngressError};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("tls error: {0}")]
    Tls(#[from] TlsError),

    #[error("port allocator error: {0}")]
    PortAlloc(#[from] PortAllocError),

    #[error("tcp ingress error: {0}")]
    TcpIngress(#[from] TcpIngressError),
}

/// A running relay: bound addresses plus the shared registry.
pub struct RelayHandle {
    pub control_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub https_addr: Option<SocketAddr>,
    pub registry: Arc<TunnelRegistry>,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayHandle {
    /// Stop the accept loops. In-flight connections are not drained; the
    /// mux close path EOFs their forwarding tasks.
    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

pub struct Relay;

impl Relay {
    /// Bring up a relay from `config` over the given repository.
    pub async fn start(config: RelayConfig, repo: Arc<dyn Repository>) -> Result<RelayHandle, RelayError> {
        config.validate()?;

        // Rows left active by a previous run have no live control channel;
        // clients re-register on reconnect.
        let swept = repo.close_all_active().await?;
        if swept > 0 {
            info!(swept, "closed stale tunnel records from previous run");
        }

        let registry = Arc::new(TunnelRegistry::new());
        let allocator = config
            .tcp_port_range
            .map(|(start, end)| PortAllocator::new(start, end))
            .transpose()?
            .map(Arc::new);

        let mut session_config = SessionConfig::new(&config.domain);
        session_config.auth_timeout = config.auth_timeout;
        session_config.idle_timeout = config.idle_timeout;
        session_config.mux_accept_timeout = config.mux_accept_timeout;

        let control = Arc::new(ControlServer::new(
            registry.clone(),
            repo.clone(),
            allocator,
            session_config,
        ));
        let control_listener = TcpListener::bind(("0.0.0.0", config.control_port)).await?;
        let control_addr = control_listener.local_addr()?;

        let ingress = Arc::new(
            HttpIngress::new(&config.domain, registry.clone()).with_repository(repo.clone()),
        );
        let http_listener = TcpListener::bind(("0.0.0.0", config.http_port)).await?;
        let http_addr = http_listener.local_addr()?;

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(control.run(control_listener)));
        tasks.push(tokio::spawn(ingress.clone().run(http_listener)));

        let https_addr = match &config.tls {
            Some(tls) => {
                let acceptor = build_acceptor(&tls.cert_path, &tls.key_path)?;
                let https_listener = TcpListener::bind(("0.0.0.0", config.https_port)).await?;
                let addr = https_listener.local_addr()?;
                tasks.push(tokio::spawn(ingress.clone().run_tls(https_listener, acceptor)));
                Some(addr)
            }
            None => None,
        };

        if let Some((start, end)) = config.tcp_port_range {
            TcpIngress::new(registry.clone()).start(start, end).await?;
        }

        info!(
            domain = %config.domain,
            control = %control_addr,
            http = %http_addr,
            https = ?https_addr,
            tcp_range = ?config.tcp_port_range,
            "relay started"
        );

        Ok(RelayHandle {
            control_addr,
            http_addr,
            https_addr,
            registry,
            tasks,
        })
    }
}
