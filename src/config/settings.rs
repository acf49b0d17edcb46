use crate::error::{BlockchainError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;

const DB_PATH_KEY: &str = "FROSTLINE_DB_PATH";
const PORT_KEY: &str = "FROSTLINE_PORT";
const NETWORK_KEY: &str = "FROSTLINE_NETWORK";
const SEEDS_KEY: &str = "FROSTLINE_SEEDS";

/// Node settings. Every field has a default so a config file only needs
/// the values it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// `regtest` or a path to a network definition file
    pub network: String,
    pub db_path: String,
    pub listen_port: u16,
    /// Host other nodes should use to reach us. Unset means we don't
    /// advertise ourselves in tips.
    pub advertise_host: Option<String>,
    /// `host:port` or bare hosts on the network's default port
    pub seed_peers: Vec<String>,
    pub peer_count: usize,
    /// Store every transaction by hash
    pub tx_index: bool,
    pub mempool_eviction_grace_ms: i64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            network: "regtest".to_string(),
            db_path: "data/frostline".to_string(),
            listen_port: 2340,
            advertise_host: None,
            seed_peers: vec![],
            peer_count: 8,
            tx_index: false,
            mempool_eviction_grace_ms: 60_000,
        }
    }
}

impl NodeConfig {
    /// Reads `path` if given, otherwise starts from the defaults, then
    /// applies `FROSTLINE_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<NodeConfig> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => NodeConfig::default(),
        };
        config.apply_overrides(|key| env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<NodeConfig> {
        let text = fs::read_to_string(path).map_err(|e| {
            BlockchainError::Config(format!("Failed to read config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<NodeConfig> {
        let config: NodeConfig = toml::from_str(text)?;
        if config.peer_count == 0 {
            return Err(BlockchainError::Config(
                "peer_count must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }

    /// Overrides from `lookup`, which maps a variable name to its value
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(db_path) = lookup(DB_PATH_KEY) {
            self.db_path = db_path;
        }
        if let Some(port) = lookup(PORT_KEY) {
            self.listen_port = port.trim().parse().map_err(|e| {
                BlockchainError::Config(format!("Invalid {PORT_KEY} value {port}: {e}"))
            })?;
        }
        if let Some(network) = lookup(NETWORK_KEY) {
            self.network = network;
        }
        if let Some(seeds) = lookup(SEEDS_KEY) {
            self.seed_peers = seeds
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        Ok(())
    }
}
