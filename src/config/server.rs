//! Exposition server settings.

use std::{
    net::{Ipv4Addr, SocketAddr, ToSocketAddrs},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use validator::Validate;

use super::ConfigError;
use crate::core::metrics::render::DEFAULT_COMPRESSION_LEVEL;

/// Timeouts and compression applied by the `/metrics` server.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Seconds to wait for a new connection before re-entering accept.
    ///
    /// Must be at least 1 second.
    #[validate(range(min = 1, message = "Accept timeout must be at least 1 second"))]
    pub accept_timeout: u64,

    /// Seconds a single socket read or write may stall, also the limit for
    /// receiving the request head. Time spent collecting is not counted.
    ///
    /// Must be at least 1 second.
    #[validate(range(min = 1, message = "Connection timeout must be at least 1 second"))]
    pub connection_timeout: u64,

    /// gzip level for scrape responses, 0 (store) to 9 (best).
    #[validate(range(max = 9, message = "Compression level must be between 0 and 9"))]
    pub compression_level: u32,
}

impl ServerConfig {
    pub fn accept_timeout(&self) -> Duration {
        Duration::from_secs(self.accept_timeout)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            accept_timeout: 15,
            connection_timeout: 5,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

/// Resolves a `[host]:port` listen address. An empty host means all IPv4
/// interfaces, so `:9090` binds `0.0.0.0:9090`.
pub fn parse_bind_address(raw: &str) -> Result<SocketAddr, ConfigError> {
    let invalid = || ConfigError::InvalidBind(raw.to_string());

    let (host, port) = raw.rsplit_once(':').ok_or_else(invalid)?;
    let port: u16 = port.parse().map_err(|_| invalid())?;
    let host = host.trim_start_matches('[').trim_end_matches(']');

    if host.is_empty() {
        return Ok(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)));
    }
    (host, port)
        .to_socket_addrs()
        .map_err(|_| invalid())?
        .next()
        .ok_or_else(invalid)
}
