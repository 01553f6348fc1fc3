//! Domain models and the repository contract

use async_trait::async_trait;
use burrow_proto::TunnelProtocol;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("corrupt record: {0}")]
    CorruptRecord(String),
}

/// A client allowed to create tunnels. Created by external token-issuance
/// tooling; the relay only reads these rows during authentication.
#[derive(Debug, Clone, PartialEq)]
pub struct Client {
    pub id: String,
    pub name: String,
    pub api_token: String,
    pub max_tunnels: i32,
    /// Empty means unrestricted.
    pub allowed_subdomains: Vec<String>,
    pub status: String,
}

impl Client {
    /// Whether this client may claim the given subdomain.
    pub fn may_use_subdomain(&self, subdomain: &str) -> bool {
        self.allowed_subdomains.is_empty() || self.allowed_subdomains.iter().any(|s| s == subdomain)
    }
}

/// Tunnel row status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    Active,
    Closed,
}

impl TunnelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelStatus::Active => "active",
            TunnelStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(TunnelStatus::Active),
            "closed" => Some(TunnelStatus::Closed),
            _ => None,
        }
    }
}

/// A durable tunnel record. The live counterpart is the registry binding;
/// closing one must close the other.
#[derive(Debug, Clone, PartialEq)]
pub struct Tunnel {
    pub id: String,
    pub client_id: String,
    pub subdomain: String,
    pub protocol: TunnelProtocol,
    pub local_host: String,
    pub local_port: u16,
    pub public_url: Option<String>,
    pub public_port: Option<u16>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub status: TunnelStatus,
}

/// One proxied exchange, written by the HTTP ingress after completion.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionLog {
    pub tunnel_id: String,
    pub client_ip: Option<String>,
    pub request_method: Option<String>,
    pub request_path: Option<String>,
    pub response_status: Option<i32>,
    pub bytes_sent: i64,
    pub bytes_received: i64,
    pub duration_ms: i64,
}

/// Contract the relay core programs against. Implementations must be safe
/// under concurrent use from many session and ingress tasks.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Look up an active client by its API token.
    async fn get_client_by_token(&self, token: &str) -> Result<Option<Client>, StorageError>;

    async fn create_tunnel(&self, tunnel: &Tunnel) -> Result<(), StorageError>;

    /// Active tunnel registered under the subdomain, if any.
    async fn get_tunnel_by_subdomain(&self, subdomain: &str) -> Result<Option<Tunnel>, StorageError>;

    /// Mark a tunnel closed. Idempotent; closing an unknown or already
    /// closed tunnel is a no-op.
    async fn close_tunnel(&self, tunnel_id: &str) -> Result<(), StorageError>;

    async fn get_active_tunnels_by_client(&self, client_id: &str) -> Result<Vec<Tunnel>, StorageError>;

    /// Close every active tunnel row. Run at startup: clients re-register
    /// on reconnect, and bindings are never resurrected from storage.
    async fn close_all_active(&self) -> Result<u64, StorageError>;

    /// Record one proxied exchange. Best-effort from the data path.
    async fn log_connection(&self, entry: ConnectionLog) -> Result<(), StorageError>;
}

/// In-memory repository. All state is lost on restart; used by tests and
/// embedded relays that do not need durability.
pub struct InMemoryRepository {
    clients: Mutex<Vec<Client>>,
    tunnels: Mutex<HashMap<String, Tunnel>>,
    logs: Mutex<Vec<ConnectionLog>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(Vec::new()),
            tunnels: Mutex::new(HashMap::new()),
            logs: Mutex::new(Vec::new()),
        }
    }

    pub fn insert_client(&self, client: Client) {
        self.clients.lock().unwrap().push(client);
    }

    pub fn connection_logs(&self) -> Vec<ConnectionLog> {
        self.logs.lock().unwrap().clone()
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn get_client_by_token(&self, token: &str) -> Result<Option<Client>, StorageError> {
        Ok(self
            .clients
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.api_token == token && c.status == "active")
            .cloned())
    }

    async fn create_tunnel(&self, tunnel: &Tunnel) -> Result<(), StorageError> {
        let mut tunnels = self.tunnels.lock().unwrap();
        if tunnels
            .values()
            .any(|t| t.status == TunnelStatus::Active && t.subdomain == tunnel.subdomain)
        {
            return Err(StorageError::Database(sea_orm::DbErr::Custom(format!(
                "unique constraint violated: active tunnel for subdomain {}",
                tunnel.subdomain
            ))));
        }
        tunnels.insert(tunnel.id.clone(), tunnel.clone());
        Ok(())
    }

    async fn get_tunnel_by_subdomain(&self, subdomain: &str) -> Result<Option<Tunnel>, StorageError> {
        Ok(self
            .tunnels
            .lock()
            .unwrap()
            .values()
            .find(|t| t.status == TunnelStatus::Active && t.subdomain == subdomain)
            .cloned())
    }

    async fn close_tunnel(&self, tunnel_id: &str) -> Result<(), StorageError> {
        if let Some(tunnel) = self.tunnels.lock().unwrap().get_mut(tunnel_id) {
            tunnel.status = TunnelStatus::Closed;
            tunnel.closed_at.get_or_insert_with(Utc::now);
        }
        Ok(())
    }

    async fn get_active_tunnels_by_client(&self, client_id: &str) -> Result<Vec<Tunnel>, StorageError> {
        Ok(self
            .tunnels
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.status == TunnelStatus::Active && t.client_id == client_id)
            .cloned()
            .collect())
    }

    async fn close_all_active(&self) -> Result<u64, StorageError> {
        let mut closed = 0;
        for tunnel in self.tunnels.lock().unwrap().values_mut() {
            if tunnel.status == TunnelStatus::Active {
                tunnel.status = TunnelStatus::Closed;
                tunnel.closed_at.get_or_insert_with(Utc::now);
                closed += 1;
            }
        }
        Ok(closed)
    }

    async fn log_connection(&self, entry: ConnectionLog) -> Result<(), StorageError> {
        self.logs.lock().unwrap().push(entry);
        Ok(())
    }
}
