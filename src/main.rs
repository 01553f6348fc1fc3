//! Burrow relay server
//!
//! Exposes services behind NAT to the public internet: clients hold a
//! WebSocket control connection, the relay terminates public HTTP/HTTPS/TCP
//! traffic and pipes it back over multiplexed tunnels.

use anyhow::{bail, Context, Result};
use burrow_lib::{Relay, RelayConfig, SqliteRepository, TlsFiles};
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Burrow - reverse-tunneling relay server
#[derive(Parser, Debug)]
#[command(name = "burrow-relay")]
#[command(about = "Burrow - expose local services through a public relay")]
#[command(version)]
struct Cli {
    /// Public apex domain, e.g. tunnel.example.com
    #[arg(long, env = "BURROW_DOMAIN")]
    domain: String,

    /// Control-plane WebSocket port
    #[arg(long, env = "BURROW_CONTROL_PORT", default_value_t = 4443)]
    control_port: u16,

    /// Public HTTP ingress port
    #[arg(long, env = "BURROW_HTTP_PORT", default_value_t = 80)]
    http_port: u16,

    /// Public HTTPS ingress port
    #[arg(long, env = "BURROW_HTTPS_PORT", default_value_t = 443)]
    https_port: u16,

    /// PEM certificate chain covering the domain and *.domain
    #[arg(long, env = "BURROW_TLS_CERT")]
    tls_cert: Option<String>,

    /// PEM private key for the certificate
    #[arg(long, env = "BURROW_TLS_KEY")]
    tls_key: Option<String>,

    /// Public port range for TCP/gRPC tunnels, e.g. 30000-31000
    #[arg(long, env = "BURROW_TCP_PORT_RANGE")]
    tcp_port_range: Option<String>,

    /// Database connection string
    #[arg(long, env = "BURROW_DATABASE_URL", default_value = "sqlite://burrow.db?mode=rwc")]
    database_url: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let mut config = RelayConfig::new(&cli.domain);
    config.control_port = cli.control_port;
    config.http_port = cli.http_port;
    config.https_port = cli.https_port;

    config.tls = match (cli.tls_cert, cli.tls_key) {
        (Some(cert_path), Some(key_path)) => Some(TlsFiles { cert_path, key_path }),
        (None, None) => None,
        _ => bail!("--tls-cert and --tls-key must be provided together"),
    };

    if let Some(range) = &cli.tcp_port_range {
        config.tcp_port_range = Some(RelayConfig::parse_port_range(range)?);
    }

    let repo = SqliteRepository::connect(&cli.database_url)
        .await
        .context("failed to open database")?;

    let handle = Relay::start(config, Arc::new(repo))
        .await
        .context("failed to start relay")?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    handle.shutdown();

    Ok(())
}
