//! Database entities

pub mod client;
pub mod connection_log;
pub mod tunnel;

pub use client::Entity as ClientEntity;
pub use connection_log::Entity as ConnectionLogEntity;
pub use tunnel::Entity as TunnelEntity;

pub mod prelude {
    pub use super::client::Entity as ClientEntity;
    pub use super::connection_log::Entity as ConnectionLogEntity;
    pub use super::tunnel::Entity as TunnelEntity;
}
