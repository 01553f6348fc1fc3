//! Durable state for the burrow relay.
//!
//! The relay core consumes the [`Repository`] trait; routing truth lives in
//! the in-memory registry, while rows here exist for auditing and
//! restart-time recovery. The reference store is SQLite via sea-orm, with a
//! partial unique index guaranteeing at most one `active` tunnel per
//! subdomain. [`InMemoryRepository`] backs tests and embedded use.

pub mod entities;
pub mod migrator;
mod models;
mod sqlite;

pub use models::{
    Client, ConnectionLog, InMemoryRepository, Repository, StorageError, Tunnel, TunnelStatus,
};
pub use sqlite::SqliteRepository;
