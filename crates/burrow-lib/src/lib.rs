//! Relay orchestration for burrow.
//!
//! Ties the control plane, the registry, the ingress dispatchers and the
//! repository into one runnable relay. Binding happens during
//! [`Relay::start`], so callers (and tests) can read the actual listen
//! addresses from the returned [`RelayHandle`] before any traffic flows.

mod config;
mod relay;
mod tls;

pub use config::{ConfigError, RelayConfig, TlsFiles};
pub use relay::{Relay, RelayError, RelayHandle};
pub use tls::{build_acceptor, TlsError};

pub use burrow_control::{ControlServer, SessionConfig};
pub use burrow_relay_db::{
    Client, ConnectionLog, InMemoryRepository, Repository, SqliteRepository, Tunnel, TunnelStatus,
};
pub use burrow_router::{PortAllocator, TunnelRegistry};
