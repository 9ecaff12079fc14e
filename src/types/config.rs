use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use alloy::primitives::Address;
use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct ChainConfigRaw {
    pub name: String,
    pub chain_id: u64,
    pub rpc_url_env_var: String,
    pub start_block: Option<u64>,
    /// Contract addresses to restrict log collection to. Empty or absent
    /// means every contract emitting a tracked event is indexed.
    #[serde(default)]
    pub contracts: Vec<String>,
    /// When false the chain is replayed from cached log ranges only and no
    /// RPC endpoint is required.
    pub rpc_enabled: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub name: String,
    pub chain_id: u64,
    pub rpc_url_env_var: String,
    pub start_block: u64,
    pub contracts: Vec<Address>,
    pub rpc_enabled: bool,
}

fn resolve_chain_config(raw: ChainConfigRaw) -> anyhow::Result<ChainConfig> {
    let contracts = raw
        .contracts
        .iter()
        .map(|s| {
            Address::from_str(s)
                .with_context(|| format!("invalid contract address '{}' for chain {}", s, raw.name))
        })
        .collect::<anyhow::Result<Vec<Address>>>()?;

    Ok(ChainConfig {
        name: raw.name,
        chain_id: raw.chain_id,
        rpc_url_env_var: raw.rpc_url_env_var,
        start_block: raw.start_block.unwrap_or(0),
        contracts,
        rpc_enabled: raw.rpc_enabled.unwrap_or(true),
    })
}

/// Pipeline tuning knobs. Every field is optional in the file; accessors
/// apply the defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineConfig {
    pub catchup_window: Option<u64>,
    pub catchup_workers: Option<usize>,
    pub transfer_batch: Option<usize>,
    pub live_poll_seconds: Option<u64>,
    pub live_workers: Option<usize>,
    pub live_batch: Option<u64>,
    pub channel_capacity: Option<usize>,
    pub requests_per_second: Option<u32>,
    pub metadata_timeout_seconds: Option<u64>,
    pub ipfs_gateway: Option<String>,
}

impl PipelineConfig {
    /// Catch-up window width in blocks. Also the cache range width.
    pub fn catchup_window(&self) -> u64 {
        self.catchup_window.unwrap_or(1000)
    }

    pub fn catchup_workers(&self) -> usize {
        self.catchup_workers.unwrap_or(3)
    }

    /// Transfers per batch handed to the field-resolution plugins.
    pub fn transfer_batch(&self) -> usize {
        self.transfer_batch.unwrap_or(25)
    }

    pub fn live_poll_interval(&self) -> Duration {
        Duration::from_secs(self.live_poll_seconds.unwrap_or(180))
    }

    pub fn live_workers(&self) -> usize {
        self.live_workers.unwrap_or(8)
    }

    /// Sub-range width the live tail fetches in one request.
    pub fn live_batch(&self) -> u64 {
        self.live_batch.unwrap_or(125)
    }

    pub fn channel_capacity(&self) -> usize {
        self.channel_capacity.unwrap_or(1000)
    }

    pub fn requests_per_second(&self) -> u32 {
        self.requests_per_second.unwrap_or(10)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_seconds.unwrap_or(120))
    }

    pub fn ipfs_gateway(&self) -> &str {
        self.ipfs_gateway
            .as_deref()
            .unwrap_or("https://ipfs.io/ipfs/")
    }
}

#[derive(Debug, Deserialize)]
pub struct IndexerConfigRaw {
    pub cache_dir: Option<String>,
    pub database_url_env_var: Option<String>,
    pub chains: Vec<ChainConfigRaw>,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug)]
pub struct IndexerConfig {
    pub cache_dir: String,
    pub database_url_env_var: String,
    pub chains: Vec<ChainConfig>,
    pub pipeline: PipelineConfig,
}

impl IndexerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let raw: IndexerConfigRaw = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;

        let chains = raw
            .chains
            .into_iter()
            .map(resolve_chain_config)
            .collect::<anyhow::Result<Vec<ChainConfig>>>()?;

        anyhow::ensure!(!chains.is_empty(), "config must define at least one chain");

        Ok(IndexerConfig {
            cache_dir: raw.cache_dir.unwrap_or_else(|| "data/cache".to_string()),
            database_url_env_var: raw
                .database_url_env_var
                .unwrap_or_else(|| "DATABASE_URL".to_string()),
            chains,
            pipeline: raw.pipeline,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_config_resolves_addresses_and_defaults() {
        let raw = ChainConfigRaw {
            name: "base".to_string(),
            chain_id: 8453,
            rpc_url_env_var: "BASE_RPC_URL".to_string(),
            start_block: None,
            contracts: vec!["0x4200000000000000000000000000000000000006".to_string()],
            rpc_enabled: None,
        };
        let resolved = resolve_chain_config(raw).expect("resolves");
        assert_eq!(resolved.start_block, 0);
        assert!(resolved.rpc_enabled);
        assert_eq!(resolved.contracts.len(), 1);
    }

    #[test]
    fn chain_config_rejects_bad_address() {
        let raw = ChainConfigRaw {
            name: "base".to_string(),
            chain_id: 8453,
            rpc_url_env_var: "BASE_RPC_URL".to_string(),
            start_block: Some(5),
            contracts: vec!["not-an-address".to_string()],
            rpc_enabled: Some(true),
        };
        assert!(resolve_chain_config(raw).is_err());
    }

    #[test]
    fn pipeline_defaults_apply() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.catchup_window(), 1000);
        assert_eq!(cfg.catchup_workers(), 3);
        assert_eq!(cfg.transfer_batch(), 25);
        assert_eq!(cfg.live_batch(), 125);
        assert_eq!(cfg.live_workers(), 8);
        assert_eq!(cfg.live_poll_interval(), Duration::from_secs(180));
    }
}
