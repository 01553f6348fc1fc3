//! ConnectionLog entity: audit trail of proxied exchanges

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "connection_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    pub tunnel_id: String,

    pub client_ip: Option<String>,
    pub request_method: Option<String>,
    #[sea_orm(column_type = "Text", nullable)]
    pub request_path: Option<String>,
    pub response_status: Option<i32>,

    pub bytes_sent: i64,
    pub bytes_received: i64,
    pub duration_ms: i64,

    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::tunnel::Entity",
        from = "Column::TunnelId",
        to = "super::tunnel::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Tunnel,
}

impl Related<super::tunnel::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Tunnel.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
