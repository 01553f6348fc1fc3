//! Active tunnel registry
//!
//! Three indices (subdomain, public port, owning client) are kept mutually
//! consistent under a single reader-writer lock. Ingress dispatchers are the
//! high-rate readers; control sessions are the low-rate writers. The lock is
//! held only across index mutation, never across network I/O: closing a mux
//! session happens after the write guard is released.

use burrow_mux::{MuxError, MuxSession, MuxStream};
use burrow_proto::{ControlMessage, TunnelProtocol};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("subdomain {0} is already in use")]
    SubdomainTaken(String),

    #[error("port {0} is already in use")]
    PortTaken(u16),

    #[error("tunnel not found: {0}")]
    NotFound(String),

    #[error("mux session already set for tunnel: {0}")]
    MuxAlreadySet(String),

    #[error("mux session not established for tunnel: {0}")]
    MuxNotReady(String),

    #[error("failed to open stream: {0}")]
    Stream(#[from] MuxError),
}

/// Mux slot lifecycle: set exactly once, never re-opened after close.
enum MuxSlot {
    Unset,
    Set(Arc<MuxSession>),
    Closed,
}

/// In-memory representation of one active tunnel.
pub struct TunnelBinding {
    /// Tunnel id, shared with the repository row
    pub id: String,
    /// Owning client
    pub client_id: String,
    /// Subdomain key; present for every protocol, it is the registry's
    /// primary identity even for port-routed tunnels
    pub subdomain: String,
    pub protocol: TunnelProtocol,
    pub local_host: String,
    pub local_port: u16,
    /// Public URL for HTTP-family tunnels
    pub public_url: Option<String>,
    /// Public port for TCP/gRPC tunnels
    pub public_port: Option<u16>,
    /// Advertised gRPC services, if any
    pub grpc_services: Vec<String>,
    /// Max concurrent gRPC streams, if constrained
    pub max_streams: Option<u32>,
    /// Outbound handle of the owning control connection
    pub control: mpsc::Sender<ControlMessage>,
    mux: Mutex<MuxSlot>,
}

impl std::fmt::Debug for TunnelBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelBinding")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("subdomain", &self.subdomain)
            .field("protocol", &self.protocol)
            .field("public_port", &self.public_port)
            .finish()
    }
}

impl TunnelBinding {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        client_id: String,
        subdomain: String,
        protocol: TunnelProtocol,
        local_host: String,
        local_port: u16,
        public_url: Option<String>,
        public_port: Option<u16>,
        control: mpsc::Sender<ControlMessage>,
    ) -> Self {
        Self {
            id,
            client_id,
            subdomain,
            protocol,
            local_host,
            local_port,
            public_url,
            public_port,
            grpc_services: Vec::new(),
            max_streams: None,
            control,
            mux: Mutex::new(MuxSlot::Unset),
        }
    }

    /// Borrow the mux session if it is in the steady `Set` state.
    fn session(&self) -> Option<Arc<MuxSession>> {
        match &*self.mux.lock().unwrap() {
            MuxSlot::Set(session) => Some(session.clone()),
            _ => None,
        }
    }

    fn set_session(&self, session: Arc<MuxSession>) -> Result<(), RegistryError> {
        let mut slot = self.mux.lock().unwrap();
        match &*slot {
            MuxSlot::Unset => {
                *slot = MuxSlot::Set(session);
                Ok(())
            }
            _ => Err(RegistryError::MuxAlreadySet(self.subdomain.clone())),
        }
    }

    /// Take the session out for closing, leaving the terminal state behind.
    fn take_session(&self) -> Option<Arc<MuxSession>> {
        let mut slot = self.mux.lock().unwrap();
        match std::mem::replace(&mut *slot, MuxSlot::Closed) {
            MuxSlot::Set(session) => Some(session),
            _ => None,
        }
    }

    /// Open a data stream towards the client for one public connection.
    pub async fn open_stream(&self) -> Result<MuxStream, RegistryError> {
        let session = self
            .session()
            .ok_or_else(|| RegistryError::MuxNotReady(self.subdomain.clone()))?;
        Ok(session.open().await?)
    }
}

struct Indices {
    by_subdomain: HashMap<String, Arc<TunnelBinding>>,
    by_port: HashMap<u16, Arc<TunnelBinding>>,
    by_client: HashMap<String, Vec<Arc<TunnelBinding>>>,
}

/// Registry of active tunnels.
pub struct TunnelRegistry {
    inner: RwLock<Indices>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Indices {
                by_subdomain: HashMap::new(),
                by_port: HashMap::new(),
                by_client: HashMap::new(),
            }),
        }
    }

    /// Register a binding atomically across all indices.
    ///
    /// On a port conflict the subdomain insert is not performed; the
    /// existing binding is never evicted.
    pub fn register(&self, binding: TunnelBinding) -> Result<Arc<TunnelBinding>, RegistryError> {
        let mut indices = self.inner.write().unwrap();

        if indices.by_subdomain.contains_key(&binding.subdomain) {
            return Err(RegistryError::SubdomainTaken(binding.subdomain));
        }
        if let Some(port) = binding.public_port {
            if indices.by_port.contains_key(&port) {
                return Err(RegistryError::PortTaken(port));
            }
        }

        let binding = Arc::new(binding);
        if let Some(port) = binding.public_port {
            indices.by_port.insert(port, binding.clone());
        }
        indices
            .by_subdomain
            .insert(binding.subdomain.clone(), binding.clone());
        indices
            .by_client
            .entry(binding.client_id.clone())
            .or_default()
            .push(binding.clone());

        Ok(binding)
    }

    /// Remove a binding from all indices, then close its mux session
    /// outside the lock. Idempotent.
    pub async fn unregister(&self, subdomain: &str) {
        let removed = {
            let mut indices = self.inner.write().unwrap();
            let Some(binding) = indices.by_subdomain.remove(subdomain) else {
                return;
            };
            if let Some(port) = binding.public_port {
                indices.by_port.remove(&port);
            }
            if let Some(owned) = indices.by_client.get_mut(&binding.client_id) {
                owned.retain(|b| b.subdomain != subdomain);
                if owned.is_empty() {
                    indices.by_client.remove(&binding.client_id);
                }
            }
            binding
        };

        if let Some(session) = removed.take_session() {
            debug!(subdomain, "closing mux session for unregistered tunnel");
            session.close().await;
        }
    }

    pub fn get_by_subdomain(&self, subdomain: &str) -> Option<Arc<TunnelBinding>> {
        self.inner.read().unwrap().by_subdomain.get(subdomain).cloned()
    }

    pub fn get_by_port(&self, port: u16) -> Option<Arc<TunnelBinding>> {
        self.inner.read().unwrap().by_port.get(&port).cloned()
    }

    pub fn get_by_client(&self, client_id: &str) -> Vec<Arc<TunnelBinding>> {
        self.inner
            .read()
            .unwrap()
            .by_client
            .get(client_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Attach the mux session to an active binding. The slot moves
    /// `unset → set` exactly once.
    pub fn set_mux_session(&self, subdomain: &str, session: Arc<MuxSession>) -> Result<(), RegistryError> {
        let binding = self
            .get_by_subdomain(subdomain)
            .ok_or_else(|| RegistryError::NotFound(subdomain.to_string()))?;
        binding.set_session(session)
    }

    /// Open a stream on the tunnel registered under `subdomain`.
    pub async fn open_stream(&self, subdomain: &str) -> Result<MuxStream, RegistryError> {
        let binding = self
            .get_by_subdomain(subdomain)
            .ok_or_else(|| RegistryError::NotFound(subdomain.to_string()))?;
        binding.open_stream().await
    }

    pub fn count(&self) -> usize {
        self.inner.read().unwrap().by_subdomain.len()
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(subdomain: &str, client_id: &str, public_port: Option<u16>) -> TunnelBinding {
        let (control, _rx) = mpsc::channel(1);
        let (protocol, public_url) = if public_port.is_some() {
            (TunnelProtocol::Tcp, None)
        } else {
            (TunnelProtocol::Http, Some(format!("https://{subdomain}.example.test")))
        };
        // The receiver is dropped; these tests never write to the channel.
        TunnelBinding::new(
            format!("id-{subdomain}"),
            client_id.to_string(),
            subdomain.to_string(),
            protocol,
            "localhost".to_string(),
            3000,
            public_url,
            public_port,
            control,
        )
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = TunnelRegistry::new();
        registry.register(binding("myapp", "client-1", None)).unwrap();

        let found = registry.get_by_subdomain("myapp").unwrap();
        assert_eq!(found.client_id, "client-1");
        assert_eq!(registry.count(), 1);
        assert!(registry.get_by_subdomain("other").is_none());
    }

    #[test]
    fn test_duplicate_subdomain_rejected() {
        let registry = TunnelRegistry::new();
        registry.register(binding("myapp", "client-1", None)).unwrap();

        let err = registry.register(binding("myapp", "client-2", None)).unwrap_err();
        assert!(matches!(err, RegistryError::SubdomainTaken(_)));

        // The existing binding is never evicted.
        assert_eq!(registry.get_by_subdomain("myapp").unwrap().client_id, "client-1");
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_port_conflict_leaves_no_partial_state() {
        let registry = TunnelRegistry::new();
        registry.register(binding("db", "client-1", Some(30000))).unwrap();

        let err = registry.register(binding("db2", "client-2", Some(30000))).unwrap_err();
        assert!(matches!(err, RegistryError::PortTaken(30000)));

        // The losing subdomain must not have been inserted either.
        assert!(registry.get_by_subdomain("db2").is_none());
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn test_unregister_clears_all_indices() {
        let registry = TunnelRegistry::new();
        registry.register(binding("db", "client-1", Some(30000))).unwrap();
        registry.register(binding("web", "client-1", None)).unwrap();
        assert_eq!(registry.get_by_client("client-1").len(), 2);

        registry.unregister("db").await;

        assert!(registry.get_by_subdomain("db").is_none());
        assert!(registry.get_by_port(30000).is_none());
        assert_eq!(registry.get_by_client("client-1").len(), 1);
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let registry = TunnelRegistry::new();
        registry.register(binding("web", "client-1", None)).unwrap();

        registry.unregister("web").await;
        registry.unregister("web").await;

        assert_eq!(registry.count(), 0);
        assert!(registry.get_by_client("client-1").is_empty());
    }

    #[tokio::test]
    async fn test_set_mux_session_once() {
        let registry = TunnelRegistry::new();
        registry.register(binding("web", "client-1", None)).unwrap();

        let (a, _b) = tokio::io::duplex(1024);
        registry.set_mux_session("web", Arc::new(MuxSession::server(a))).unwrap();

        let (c, _d) = tokio::io::duplex(1024);
        let err = registry.set_mux_session("web", Arc::new(MuxSession::server(c))).unwrap_err();
        assert!(matches!(err, RegistryError::MuxAlreadySet(_)));

        let (e, _f) = tokio::io::duplex(1024);
        let err = registry.set_mux_session("ghost", Arc::new(MuxSession::server(e))).unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_open_stream_requires_session() {
        let registry = TunnelRegistry::new();
        registry.register(binding("web", "client-1", None)).unwrap();

        let err = registry.open_stream("web").await.unwrap_err();
        assert!(matches!(err, RegistryError::MuxNotReady(_)));

        let err = registry.open_stream("ghost").await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_register_unregister_stays_consistent() {
        let registry = Arc::new(TunnelRegistry::new());

        let mut tasks = Vec::new();
        for i in 0..16u16 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let subdomain = format!("app-{i}");
                for round in 0..50u16 {
                    registry
                        .register(binding(&subdomain, "client-1", Some(40000 + i)))
                        .unwrap();
                    if round % 2 == 0 {
                        assert!(registry.get_by_port(40000 + i).is_some());
                    }
                    registry.unregister(&subdomain).await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // Quiescent point: every index is empty again.
        assert_eq!(registry.count(), 0);
        for i in 0..16u16 {
            assert!(registry.get_by_subdomain(&format!("app-{i}")).is_none());
            assert!(registry.get_by_port(40000 + i).is_none());
        }
        assert!(registry.get_by_client("client-1").is_empty());
    }

    #[tokio::test]
    async fn test_open_stream_through_session() {
        let registry = TunnelRegistry::new();
        registry.register(binding("web", "client-1", None)).unwrap();

        let (a, b) = tokio::io::duplex(64 * 1024);
        registry.set_mux_session("web", Arc::new(MuxSession::server(a))).unwrap();
        let client = MuxSession::client(b);

        let opened = registry.open_stream("web").await;
        assert!(opened.is_ok());
        assert!(client.accept().await.is_some());
    }
}
