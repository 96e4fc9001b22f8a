//! Validated process configuration for both roles.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::error::ConfigError;
use crate::packet::USRNAME_SIZE;

pub const DEFAULT_PORT: u16 = 9034;
pub const PORT_MIN: u16 = 1024;
pub const PORT_MAX: u16 = 49151;

/// Escalation rule for tolerated protocol faults on one server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrikePolicy {
    /// Strikes inside one window that get a connection kicked.
    pub limit: u32,
    pub window: Duration,
}

impl Default for StrikePolicy {
    fn default() -> StrikePolicy {
        StrikePolicy {
            limit: 3,
            window: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: u16,
    /// Window slides allowed before a read is reported as desync.
    pub max_resyncs: usize,
    /// Bound on a single send, and on how long a partial frame may stall.
    pub io_timeout: Duration,
    pub strikes: StrikePolicy,
    pub initial_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            port: DEFAULT_PORT,
            max_resyncs: 8,
            io_timeout: Duration::from_millis(200),
            strikes: StrikePolicy::default(),
            initial_capacity: 5,
        }
    }
}

impl ServerConfig {
    pub fn from_args(port: Option<&str>) -> Result<ServerConfig, ConfigError> {
        let port = match port {
            Some(port) => validate_port(port)?,
            None => DEFAULT_PORT,
        };
        Ok(ServerConfig {
            port,
            ..ServerConfig::default()
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub username: String,
    pub target: SocketAddr,
    pub max_resyncs: usize,
}

impl ClientConfig {
    pub fn from_args(
        username: &str,
        ip: &str,
        port: Option<&str>,
    ) -> Result<ClientConfig, ConfigError> {
        let port = match port {
            Some(port) => validate_port(port)?,
            None => DEFAULT_PORT,
        };
        Ok(ClientConfig {
            username: validate_username(username)?.to_string(),
            target: SocketAddr::new(validate_ip(ip)?, port),
            max_resyncs: 64,
        })
    }
}

pub fn validate_port(port: &str) -> Result<u16, ConfigError> {
    match port.parse::<u16>() {
        Ok(num) if num >= PORT_MIN && num <= PORT_MAX => Ok(num),
        _ => Err(ConfigError::InvalidPort(port.to_string())),
    }
}

pub fn validate_ip(ip: &str) -> Result<IpAddr, ConfigError> {
    ip.parse::<IpAddr>()
        .map_err(|_| ConfigError::InvalidIp(ip.to_string()))
}

pub fn validate_username(username: &str) -> Result<&str, ConfigError> {
    if username.is_empty() || username.len() > USRNAME_SIZE {
        return Err(ConfigError::UsernameLength);
    }
    if username.contains('\0') {
        return Err(ConfigError::UsernameNul);
    }
    Ok(username)
}
