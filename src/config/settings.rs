use crate::core::{GenesisAllocation, UNITS_PER_COIN};
use crate::error::{BlockchainError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:7001";

/// Full node configuration, deserializable from a TOML file. Every field
/// has a default so a bare `trustchain startnode` works out of the box.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Directory holding the chain files and node key material
    pub data_dir: PathBuf,
    /// Cap on mempool transactions selected into one forged block
    pub max_block_transactions: usize,
    /// Bind address for the external HTTP query surface. Carried for the
    /// API process; the node core itself does not serve HTTP.
    pub api_addr: Option<String>,
    pub network: NetworkSettings,
    pub validator: ValidatorSettings,
    /// Initial distribution minted by the genesis block when no chain
    /// exists yet
    pub genesis: Vec<GenesisEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub listen_addr: String,
    pub bootstrap_peers: Vec<String>,
    pub max_inbound: usize,
    pub max_outbound: usize,
    /// Dial attempts per address before it is abandoned
    pub max_dial_attempts: u32,
    pub dial_retry_backoff_ms: u64,
    pub ping_interval_secs: u64,
    pub handshake_timeout_secs: u64,
    pub sync_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorSettings {
    /// Whether this node forges blocks
    pub enabled: bool,
    /// PKCS#8 key file used to sign forged blocks; defaults to the node key
    /// under the data directory
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisEntry {
    pub address: String,
    pub amount: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            data_dir: PathBuf::from("./data"),
            max_block_transactions: 100,
            api_addr: None,
            network: NetworkSettings::default(),
            validator: ValidatorSettings::default(),
            genesis: default_genesis(),
        }
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        NetworkSettings {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            bootstrap_peers: Vec::new(),
            max_inbound: 32,
            max_outbound: 8,
            max_dial_attempts: 3,
            dial_retry_backoff_ms: 5_000,
            ping_interval_secs: 30,
            handshake_timeout_secs: 10,
            sync_interval_secs: 30,
        }
    }
}

impl Default for ValidatorSettings {
    fn default() -> Self {
        ValidatorSettings {
            enabled: false,
            key_file: None,
        }
    }
}

/// 60/20/10/10 split of the initial issuance across the operating pools
fn default_genesis() -> Vec<GenesisEntry> {
    const GENESIS_ISSUANCE: u64 = 1_000_000 * UNITS_PER_COIN;
    vec![
        GenesisEntry {
            address: "TRUST_GENESIS_POOL".to_string(),
            amount: GENESIS_ISSUANCE * 60 / 100,
        },
        GenesisEntry {
            address: "TRUST_VALIDATOR_REWARDS_POOL".to_string(),
            amount: GENESIS_ISSUANCE * 20 / 100,
        },
        GenesisEntry {
            address: "TRUST_DEVELOPMENT_FUND".to_string(),
            amount: GENESIS_ISSUANCE * 10 / 100,
        },
        GenesisEntry {
            address: "TRUST_ECOSYSTEM_GROWTH".to_string(),
            amount: GENESIS_ISSUANCE * 10 / 100,
        },
    ]
}

impl NodeConfig {
    /// Load from a TOML file, or fall back to defaults when no path is
    /// given. Naming a file that cannot be read or parsed is an error.
    pub fn load(path: Option<&Path>) -> Result<NodeConfig> {
        let path = match path {
            Some(path) => path,
            None => return Ok(NodeConfig::default()),
        };
        let raw = fs::read_to_string(path).map_err(|e| {
            BlockchainError::Config(format!("Failed to read config {}: {e}", path.display()))
        })?;
        toml::from_str(&raw).map_err(|e| {
            BlockchainError::Config(format!("Failed to parse config {}: {e}", path.display()))
        })
    }

    pub fn genesis_allocations(&self) -> Vec<GenesisAllocation> {
        self.genesis
            .iter()
            .map(|entry| GenesisAllocation {
                address: entry.address.clone(),
                amount: entry.amount,
            })
            .collect()
    }

    /// Path of the node's PKCS#8 key: the configured validator key file, or
    /// the default key under the data directory
    pub fn node_key_path(&self) -> PathBuf {
        self.validator
            .key_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("node_key.pk8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let config = NodeConfig::default();
        assert_eq!(config.network.listen_addr, DEFAULT_LISTEN_ADDR);
        assert!(!config.validator.enabled);
        assert_eq!(config.genesis.len(), 4);
        let total: u64 = config.genesis.iter().map(|entry| entry.amount).sum();
        assert_eq!(total, 1_000_000 * UNITS_PER_COIN);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let parsed: NodeConfig = toml::from_str(
            r#"
            data_dir = "/tmp/trustchain"

            [network]
            listen_addr = "127.0.0.1:9100"
            bootstrap_peers = ["127.0.0.1:9101"]

            [validator]
            enabled = true
            "#,
        )
        .unwrap();
        assert_eq!(parsed.data_dir, PathBuf::from("/tmp/trustchain"));
        assert_eq!(parsed.network.listen_addr, "127.0.0.1:9100");
        assert_eq!(parsed.network.max_outbound, 8);
        assert!(parsed.validator.enabled);
        assert_eq!(parsed.genesis.len(), 4);
    }

    #[test]
    fn missing_named_config_is_an_error() {
        let err = NodeConfig::load(Some(Path::new("/nonexistent/config.toml"))).unwrap_err();
        assert!(matches!(err, BlockchainError::Config(_)));
    }
}
