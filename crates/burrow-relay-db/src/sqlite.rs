//! SQLite-backed repository

use crate::entities::{client, connection_log, tunnel};
use crate::migrator::Migrator;
use crate::models::{Client, ConnectionLog, Repository, StorageError, Tunnel, TunnelStatus};
use async_trait::async_trait;
use burrow_proto::TunnelProtocol;
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Database, DatabaseConnection, EntityTrait, NotSet, QueryFilter,
    Set,
};
use sea_orm_migration::MigratorTrait;
use tracing::info;

/// Reference repository over SQLite. `connect` runs pending migrations.
pub struct SqliteRepository {
    db: DatabaseConnection,
}

impl SqliteRepository {
    /// Open (or create) the database at `url`, e.g.
    /// `sqlite://burrow.db?mode=rwc`, and bring the schema up to date.
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let db = Database::connect(url).await?;
        Migrator::up(&db, None).await?;
        info!(url, "database ready");
        Ok(Self { db })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Insert a client row. Token issuance tooling and tests seed clients
    /// through this; the relay itself never writes clients.
    pub async fn insert_client(&self, c: &Client) -> Result<(), StorageError> {
        let allowed = if c.allowed_subdomains.is_empty() {
            None
        } else {
            Some(c.allowed_subdomains.join(","))
        };
        client::ActiveModel {
            id: Set(c.id.clone()),
            name: Set(c.name.clone()),
            api_token: Set(c.api_token.clone()),
            max_tunnels: Set(c.max_tunnels),
            allowed_subdomains: Set(allowed),
            created_at: Set(Utc::now()),
            updated_at: Set(Utc::now()),
            status: Set(c.status.clone()),
        }
        .insert(&self.db)
        .await?;
        Ok(())
    }
}

fn client_from_model(m: client::Model) -> Client {
    let allowed_subdomains = m
        .allowed_subdomains
        .map(|s| {
            s.split(',')
                .map(|part| part.trim().to_string())
                .filter(|part| !part.is_empty())
                .collect()
        })
        .unwrap_or_default();
    Client {
        id: m.id,
        name: m.name,
        api_token: m.api_token,
        max_tunnels: m.max_tunnels,
        allowed_subdomains,
        status: m.status,
    }
}

fn tunnel_from_model(m: tunnel::Model) -> Result<Tunnel, StorageError> {
    let protocol = TunnelProtocol::parse(&m.protocol)
        .ok_or_else(|| StorageError::CorruptRecord(format!("unknown protocol: {}", m.protocol)))?;
    let status = TunnelStatus::parse(&m.status)
        .ok_or_else(|| StorageError::CorruptRecord(format!("unknown status: {}", m.status)))?;
    let local_port = u16::try_from(m.local_port)
        .map_err(|_| StorageError::CorruptRecord(format!("local port out of range: {}", m.local_port)))?;
    let public_port = m
        .public_port
        .map(u16::try_from)
        .transpose()
        .map_err(|_| StorageError::CorruptRecord("public port out of range".to_string()))?;
    Ok(Tunnel {
        id: m.id,
        client_id: m.client_id,
        subdomain: m.subdomain,
        protocol,
        local_host: m.local_host,
        local_port,
        public_url: m.public_url,
        public_port,
        created_at: m.created_at,
        closed_at: m.closed_at,
        status,
    })
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn get_client_by_token(&self, token: &str) -> Result<Option<Client>, StorageError> {
        let found = client::Entity::find()
            .filter(client::Column::ApiToken.eq(token))
            .filter(client::Column::Status.eq("active"))
            .one(&self.db)
            .await?;
        Ok(found.map(client_from_model))
    }

    async fn create_tunnel(&self, t: &Tunnel) -> Result<(), StorageError> {
        tunnel::ActiveModel {
            id: Set(t.id.clone()),
            client_id: Set(t.client_id.clone()),
            subdomain: Set(t.subdomain.clone()),
            protocol: Set(t.protocol.as_str().to_string()),
            local_host: Set(t.local_host.clone()),
            local_port: Set(i32::from(t.local_port)),
            public_port: Set(t.public_port.map(i32::from)),
            public_url: Set(t.public_url.clone()),
            created_at: Set(t.created_at),
            closed_at: Set(t.closed_at),
            status: Set(t.status.as_str().to_string()),
        }
        .insert(&self.db)
        .await?;
        Ok(())
    }

    async fn get_tunnel_by_subdomain(&self, subdomain: &str) -> Result<Option<Tunnel>, StorageError> {
        let found = tunnel::Entity::find()
            .filter(tunnel::Column::Subdomain.eq(subdomain))
            .filter(tunnel::Column::Status.eq(TunnelStatus::Active.as_str()))
            .one(&self.db)
            .await?;
        found.map(tunnel_from_model).transpose()
    }

    async fn close_tunnel(&self, tunnel_id: &str) -> Result<(), StorageError> {
        tunnel::Entity::update_many()
            .col_expr(tunnel::Column::Status, Expr::value(TunnelStatus::Closed.as_str()))
            .col_expr(tunnel::Column::ClosedAt, Expr::value(Some(Utc::now())))
            .filter(tunnel::Column::Id.eq(tunnel_id))
            .filter(tunnel::Column::Status.eq(TunnelStatus::Active.as_str()))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn get_active_tunnels_by_client(&self, client_id: &str) -> Result<Vec<Tunnel>, StorageError> {
        let rows = tunnel::Entity::find()
            .filter(tunnel::Column::ClientId.eq(client_id))
            .filter(tunnel::Column::Status.eq(TunnelStatus::Active.as_str()))
            .all(&self.db)
            .await?;
        rows.into_iter().map(tunnel_from_model).collect()
    }

    async fn close_all_active(&self) -> Result<u64, StorageError> {
        let result = tunnel::Entity::update_many()
            .col_expr(tunnel::Column::Status, Expr::value(TunnelStatus::Closed.as_str()))
            .col_expr(tunnel::Column::ClosedAt, Expr::value(Some(Utc::now())))
            .filter(tunnel::Column::Status.eq(TunnelStatus::Active.as_str()))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }

    async fn log_connection(&self, entry: ConnectionLog) -> Result<(), StorageError> {
        connection_log::ActiveModel {
            id: NotSet,
            tunnel_id: Set(entry.tunnel_id),
            client_ip: Set(entry.client_ip),
            request_method: Set(entry.request_method),
            request_path: Set(entry.request_path),
            response_status: Set(entry.response_status),
            bytes_sent: Set(entry.bytes_sent),
            bytes_received: Set(entry.bytes_received),
            duration_ms: Set(entry.duration_ms),
            created_at: Set(Utc::now()),
        }
        .insert(&self.db)
        .await?;
        Ok(())
    }
}
