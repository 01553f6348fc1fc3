//! Initial schema: clients, tunnels, connection_logs

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // ============================================================
        // 1. clients
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(Clients::Table)
                    .if_not_exists()
                    .col(string(Clients::Id).primary_key())
                    .col(string(Clients::Name))
                    .col(string(Clients::ApiToken).unique_key())
                    .col(integer(Clients::MaxTunnels).default(5))
                    .col(text_null(Clients::AllowedSubdomains))
                    .col(
                        timestamp_with_time_zone(Clients::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(Clients::UpdatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .col(string(Clients::Status).default("active"))
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 2. tunnels
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(Tunnels::Table)
                    .if_not_exists()
                    .col(string(Tunnels::Id).primary_key())
                    .col(string(Tunnels::ClientId))
                    .col(string(Tunnels::Subdomain))
                    .col(string(Tunnels::Protocol))
                    .col(string(Tunnels::LocalHost))
                    .col(integer(Tunnels::LocalPort))
                    .col(integer_null(Tunnels::PublicPort))
                    .col(text_null(Tunnels::PublicUrl))
                    .col(
                        timestamp_with_time_zone(Tunnels::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .col(timestamp_with_time_zone_null(Tunnels::ClosedAt))
                    .col(string(Tunnels::Status).default("active"))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_tunnels_client_id")
                            .from(Tunnels::Table, Tunnels::ClientId)
                            .to(Clients::Table, Clients::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_tunnels_client_id")
                    .table(Tunnels::Table)
                    .col(Tunnels::ClientId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_tunnels_status")
                    .table(Tunnels::Table)
                    .col(Tunnels::Status)
                    .to_owned(),
            )
            .await?;

        // Partial unique index: at most one active tunnel per subdomain.
        // SeaQuery has no partial-index builder, so raw SQL it is.
        manager
            .get_connection()
            .execute_unprepared(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_tunnels_subdomain_active \
                 ON tunnels (subdomain) WHERE status = 'active'",
            )
            .await?;

        // ============================================================
        // 3. connection_logs
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(ConnectionLogs::Table)
                    .if_not_exists()
                    .col(pk_auto(ConnectionLogs::Id))
                    .col(string(ConnectionLogs::TunnelId))
                    .col(string_null(ConnectionLogs::ClientIp))
                    .col(string_null(ConnectionLogs::RequestMethod))
                    .col(text_null(ConnectionLogs::RequestPath))
                    .col(integer_null(ConnectionLogs::ResponseStatus))
                    .col(big_integer(ConnectionLogs::BytesSent).default(0))
                    .col(big_integer(ConnectionLogs::BytesReceived).default(0))
                    .col(big_integer(ConnectionLogs::DurationMs).default(0))
                    .col(
                        timestamp_with_time_zone(ConnectionLogs::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_connection_logs_tunnel_id")
                            .from(ConnectionLogs::Table, ConnectionLogs::TunnelId)
                            .to(Tunnels::Table, Tunnels::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_connection_logs_tunnel_id")
                    .table(ConnectionLogs::Table)
                    .col(ConnectionLogs::TunnelId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ConnectionLogs::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Tunnels::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Clients::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum Clients {
    Table,
    Id,
    Name,
    ApiToken,
    MaxTunnels,
    AllowedSubdomains,
    CreatedAt,
    UpdatedAt,
    Status,
}

#[derive(DeriveIden)]
enum Tunnels {
    Table,
    Id,
    ClientId,
    Subdomain,
    Protocol,
    LocalHost,
    LocalPort,
    PublicPort,
    PublicUrl,
    CreatedAt,
    ClosedAt,
    Status,
}

#[derive(DeriveIden)]
enum ConnectionLogs {
    Table,
    Id,
    TunnelId,
    ClientIp,
    RequestMethod,
    RequestPath,
    ResponseStatus,
    BytesSent,
    BytesReceived,
    DurationMs,
    CreatedAt,
}
