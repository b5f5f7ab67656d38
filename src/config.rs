// Copyright 2020 Joyent, Inc.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::error::JetError;
use crate::protocol::{DEFAULT_RECEIVE_BUFFER_SZ, JET_LENGTH_SZ};

/// Port of the raw-socket Jet interface.
pub const DEFAULT_JET_PORT: u16 = 11122;

pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Where and how to reach a Jet daemon over TCP.
///
/// Every field has a default, so partial JSON documents are accepted:
///
/// ```
/// use jet_rpc::config::ConnectionConfig;
///
/// let config = ConnectionConfig::from_json(r#"{"host": "10.0.0.7"}"#).unwrap();
/// assert_eq!(config.port, 11122);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub receive_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            host: String::from("127.0.0.1"),
            port: DEFAULT_JET_PORT,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SZ,
        }
    }
}

impl ConnectionConfig {
    pub fn from_json(text: &str) -> Result<ConnectionConfig, JetError> {
        let config: ConnectionConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), JetError> {
        if self.host.is_empty() {
            return Err(JetError::Config(String::from("host must not be empty")));
        }
        if self.receive_buffer_size <= JET_LENGTH_SZ {
            return Err(JetError::Config(format!(
                "receive buffer of {} bytes cannot hold any message",
                self.receive_buffer_size
            )));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Resolve `host` and `port`, taking the first address found.
    pub fn socket_addr(&self) -> Result<SocketAddr, JetError> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                JetError::Config(format!("{} did not resolve to an address", self.host))
            })
    }
}
