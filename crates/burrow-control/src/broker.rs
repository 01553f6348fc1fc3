//! Mux establishment
//!
//! A freshly provisioned tunnel has no data path yet. The broker binds a
//! short-lived listener on an ephemeral port, tells the client to dial it,
//! and wraps the accepted connection in a server-side yamux session attached
//! to the tunnel's binding. Missing the accept deadline, or any later end of
//! the session, tears the tunnel down in both the registry and the
//! repository; other tunnels on the same control connection are unaffected.

use burrow_mux::MuxSession;
use burrow_proto::MuxEstablish;
use burrow_relay_db::Repository;
use burrow_router::{RegistryError, TunnelBinding, TunnelRegistry};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub(crate) enum BrokerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("client did not dial the mux listener in time")]
    AcceptTimeout,

    #[error("control channel closed before mux establishment")]
    ControlChannelClosed,

    #[error("{0}")]
    Registry(#[from] RegistryError),
}

/// Drive mux establishment for one tunnel in the background, then watch the
/// session and tear the tunnel down when it ends.
pub(crate) fn spawn_establish(
    registry: Arc<TunnelRegistry>,
    repo: Arc<dyn Repository>,
    binding: Arc<TunnelBinding>,
    accept_timeout: Duration,
) {
    tokio::spawn(async move {
        match establish(&registry, &binding, accept_timeout).await {
            Ok(session_ended) => {
                session_ended.await;
                debug!(subdomain = %binding.subdomain, "mux session ended");
                teardown(&registry, &repo, &binding).await;
            }
            Err(e) => {
                warn!(
                    tunnel_id = %binding.id,
                    subdomain = %binding.subdomain,
                    "mux establishment failed: {}", e
                );
                teardown(&registry, &repo, &binding).await;
            }
        }
    });
}

async fn establish(
    registry: &TunnelRegistry,
    binding: &Arc<TunnelBinding>,
    accept_timeout: Duration,
) -> Result<impl Future<Output = ()> + Send + 'static, BrokerError> {
    let listener = TcpListener::bind(("0.0.0.0", 0)).await?;
    let mux_port = listener.local_addr()?.port();

    let establish = MuxEstablish {
        tunnel_id: binding.id.clone(),
        mux_port,
        mux_addr: format!(":{mux_port}"),
    };
    binding
        .control
        .send(establish.into_message(Uuid::new_v4().to_string()))
        .await
        .map_err(|_| BrokerError::ControlChannelClosed)?;

    let (socket, peer_addr) = timeout(accept_timeout, listener.accept())
        .await
        .map_err(|_| BrokerError::AcceptTimeout)??;
    debug!(%peer_addr, mux_port, "mux connection accepted");

    let session = Arc::new(MuxSession::server(socket));
    let session_ended = session.watch_closed();

    if let Err(e) = registry.set_mux_session(&binding.subdomain, session.clone()) {
        // The binding went away while we were waiting; drop the session.
        session.close().await;
        return Err(e.into());
    }

    info!(subdomain = %binding.subdomain, "mux session established");
    Ok(session_ended)
}

/// Remove the binding and close its repository row. Safe to run after the
/// tunnel was already cleaned up elsewhere.
pub(crate) async fn teardown(
    registry: &TunnelRegistry,
    repo: &Arc<dyn Repository>,
    binding: &Arc<TunnelBinding>,
) {
    registry.unregister(&binding.subdomain).await;
    if let Err(e) = repo.close_tunnel(&binding.id).await {
        error!(tunnel_id = %binding.id, "failed to close tunnel record: {}", e);
    }
}
