//! Server configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for one server instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for client connections.
    pub host: String,
    /// Bind port for client connections.
    pub port: u16,
    /// Generator number for this server's entity ids. All ids this server
    /// mints carry it, so it must be unique across federated peers.
    /// 0 means "pick a random nonzero id at boot".
    #[serde(default)]
    pub server_id: u32,
    /// Opaque relay credential, passed through to the relay verbatim.
    #[serde(default)]
    pub secret: String,
    /// Directory holding the transaction log.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 2007,
            server_id: 0,
            secret: String::new(),
            data_dir: default_data_dir(),
        }
    }
}

/// CLI arguments that can override the config file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub server_id: Option<u32>,
    pub secret: Option<String>,
    pub data_dir: Option<PathBuf>,
}

impl ServerConfig {
    /// Load a JSON config file.
    pub fn load(path: &Path) -> Result<ServerConfig> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Merge CLI arguments into this config (CLI takes precedence).
    pub fn apply_cli(&mut self, args: &CliOverrides) {
        if let Some(host) = &args.host {
            self.host = host.clone();
        }
        if let Some(port) = args.port {
            self.port = port;
        }
        if let Some(server_id) = args.server_id {
            self.server_id = server_id;
        }
        if let Some(secret) = &args.secret {
            self.secret = secret.clone();
        }
        if let Some(data_dir) = &args.data_dir {
            self.data_dir = data_dir.clone();
        }
    }

    /// Path of the transaction log under the data directory.
    pub fn transaction_log(&self) -> PathBuf {
        self.data_dir.join("transaction_log.txt")
    }
}
