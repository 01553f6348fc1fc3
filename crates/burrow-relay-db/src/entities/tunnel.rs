//! Tunnel entity: one row per tunnel a client ever provisioned

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tunnels")]
pub struct Model {
    /// Tunnel UUID (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    pub client_id: String,

    /// Public routing key. A partial unique index holds while
    /// `status = 'active'`; closed rows may share a subdomain.
    pub subdomain: String,

    /// "http", "https", "tcp" or "grpc"
    pub protocol: String,

    pub local_host: String,
    pub local_port: i32,

    /// Assigned public port for TCP/gRPC tunnels
    pub public_port: Option<i32>,

    /// Public URL for HTTP-family tunnels
    #[sea_orm(column_type = "Text", nullable)]
    pub public_url: Option<String>,

    pub created_at: ChronoDateTimeUtc,
    pub closed_at: Option<ChronoDateTimeUtc>,

    /// "active" or "closed"
    pub status: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::client::Entity",
        from = "Column::ClientId",
        to = "super::client::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Client,

    #[sea_orm(has_many = "super::connection_log::Entity")]
    ConnectionLog,
}

impl Related<super::client::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Client.def()
    }
}

impl Related<super::connection_log::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ConnectionLog.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
