//! Relay configuration

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("server domain is required")]
    MissingDomain,

    #[error("invalid port range: {0}")]
    InvalidPortRange(String),

    #[error("tls requires both a certificate and a key path")]
    IncompleteTls,
}

/// Certificate material for the HTTPS listener. The certificate must cover
/// the apex domain and `*.<domain>`.
#[derive(Debug, Clone)]
pub struct TlsFiles {
    pub cert_path: String,
    pub key_path: String,
}

/// Top-level relay configuration. Defaults mirror a conventional public
/// deployment; tests override the ports with 0 for ephemeral binds.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Public apex domain for subdomain routing.
    pub domain: String,
    /// Control-plane WebSocket port.
    pub control_port: u16,
    /// Plaintext HTTP ingress port.
    pub http_port: u16,
    /// TLS ingress port, used when `tls` is set.
    pub https_port: u16,
    pub tls: Option<TlsFiles>,
    /// Inclusive public port range for TCP/gRPC tunnels; absent disables
    /// port tunneling.
    pub tcp_port_range: Option<(u16, u16)>,
    /// Deadline for a client's initial `auth` message.
    pub auth_timeout: Duration,
    /// Idle window after which a silent control connection is dead.
    pub idle_timeout: Duration,
    /// Deadline for a client to dial the ephemeral mux listener.
    pub mux_accept_timeout: Duration,
}

impl RelayConfig {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            control_port: 4443,
            http_port: 80,
            https_port: 443,
            tls: None,
            tcp_port_range: None,
            auth_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            mux_accept_timeout: Duration::from_secs(30),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.domain.is_empty() {
            return Err(ConfigError::MissingDomain);
        }
        if let Some((start, end)) = self.tcp_port_range {
            if start == 0 || end < start {
                return Err(ConfigError::InvalidPortRange(format!("{start}-{end}")));
            }
        }
        Ok(())
    }

    /// Parse a `"start-end"` range string, e.g. `"30000-31000"`.
    pub fn parse_port_range(s: &str) -> Result<(u16, u16), ConfigError> {
        let invalid = || ConfigError::InvalidPortRange(s.to_string());
        let (start, end) = s.split_once('-').ok_or_else(invalid)?;
        let start: u16 = start.trim().parse().map_err(|_| invalid())?;
        let end: u16 = end.trim().parse().map_err(|_| invalid())?;
        if start == 0 || end < start {
            return Err(invalid());
        }
        Ok((start, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::new("example.test");
        assert_eq!(config.control_port, 4443);
        assert_eq!(config.http_port, 80);
        assert_eq!(config.https_port, 443);
        assert!(config.tcp_port_range.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_domain_rejected() {
        let config = RelayConfig::new("");
        assert!(matches!(config.validate(), Err(ConfigError::MissingDomain)));
    }

    #[test]
    fn test_parse_port_range() {
        assert_eq!(RelayConfig::parse_port_range("30000-31000").unwrap(), (30000, 31000));
        assert_eq!(RelayConfig::parse_port_range(" 30000 - 31000 ").unwrap(), (30000, 31000));
        assert!(RelayConfig::parse_port_range("31000-30000").is_err());
        assert!(RelayConfig::parse_port_range("0-10").is_err());
        assert!(RelayConfig::parse_port_range("30000").is_err());
        assert!(RelayConfig::parse_port_range("a-b").is_err());
    }

    #[test]
    fn test_invalid_range_in_config() {
        let mut config = RelayConfig::new("example.test");
        config.tcp_port_range = Some((31000, 30000));
        assert!(matches!(config.validate(), Err(ConfigError::InvalidPortRange(_))));
    }
}
