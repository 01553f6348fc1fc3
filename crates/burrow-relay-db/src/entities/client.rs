//! Client entity: durable identities allowed to open control connections

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "clients")]
pub struct Model {
    /// Client UUID (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    pub name: String,

    /// Opaque API token presented in `auth` messages
    #[sea_orm(unique)]
    pub api_token: String,

    pub max_tunnels: i32,

    /// Comma-separated subdomain allowlist; NULL or empty means unrestricted
    #[sea_orm(column_type = "Text", nullable)]
    pub allowed_subdomains: Option<String>,

    pub created_at: ChronoDateTimeUtc,
    pub updated_at: ChronoDateTimeUtc,

    /// "active" or "inactive"
    pub status: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::tunnel::Entity")]
    Tunnel,
}

impl Related<super::tunnel::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Tunnel.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
