//! Environment-driven node configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::{AppError, AppResult};

/// Default overlay listen address.
const DEFAULT_SWARM_ADDR: &str = "0.0.0.0:49737";
/// Default control-plane port, bound to loopback.
const DEFAULT_API_PORT: u16 = 3413;
/// Default data directory.
const DEFAULT_DATA_DIR: &str = "./peartube-data";

/// Resolved node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Root directory for the KV store and drive storage.
    pub data_dir: PathBuf,
    /// Overlay listener address.
    pub swarm_addr: SocketAddr,
    /// Bootstrap peer addresses to dial.
    pub bootstrap: Vec<String>,
    /// Control-plane port on loopback.
    pub api_port: u16,
}

impl NodeConfig {
    /// Read configuration from the environment, applying defaults.
    ///
    /// # Errors
    ///
    /// Returns an error for unparseable addresses or ports.
    pub fn from_env() -> AppResult<Self> {
        let data_dir = std::env::var("PEARTUBE_DATA_DIR")
            .map_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR), PathBuf::from);

        let swarm_raw =
            std::env::var("PEARTUBE_SWARM_ADDR").unwrap_or_else(|_| DEFAULT_SWARM_ADDR.to_string());
        let swarm_addr = swarm_raw
            .parse::<SocketAddr>()
            .map_err(|_| AppError::InvalidConfig {
                field: "PEARTUBE_SWARM_ADDR",
                reason: "not_a_socket_addr",
                value: Some(swarm_raw.clone()),
            })?;

        let bootstrap = std::env::var("PEARTUBE_BOOTSTRAP")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let api_port = match std::env::var("PEARTUBE_API_PORT") {
            Ok(raw) => raw.parse::<u16>().map_err(|_| AppError::InvalidConfig {
                field: "PEARTUBE_API_PORT",
                reason: "not_a_port",
                value: Some(raw),
            })?,
            Err(_) => DEFAULT_API_PORT,
        };

        Ok(Self {
            data_dir,
            swarm_addr,
            bootstrap,
            api_port,
        })
    }

    /// Directory for the node's JSON document store.
    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }

    /// Directory for drive storage.
    #[must_use]
    pub fn drives_dir(&self) -> PathBuf {
        self.data_dir.join("drives")
    }
}
