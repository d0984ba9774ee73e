use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub chains: Vec<ChainConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChainConfig {
    /// Chain identifier as carried by persisted rows, e.g. "1" for mainnet.
    pub chain_id: String,
    pub name: String,
    /// Ordered failover list; the pool walks it front to back.
    pub rpc_urls: Vec<String>,
    /// The vault contract whose Deposit/Withdraw events are tracked.
    pub contract_address: String,
    pub start_block: u64,
    #[serde(default = "default_required_confirmations")]
    pub required_confirmations: u64,
    #[serde(default = "default_reorg_depth")]
    pub reorg_depth: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_rpc_timeout_secs")]
    pub rpc_timeout_secs: u64,
}

fn default_required_confirmations() -> u64 {
    12
}

fn default_reorg_depth() -> u64 {
    64
}

fn default_batch_size() -> u64 {
    100
}

fn default_polling_interval_ms() -> u64 {
    2000
}

fn default_restart_delay_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_rpc_timeout_secs() -> u64 {
    30
}

impl Config {
    pub fn load(path: &str) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre::eyre!("Failed to read config file '{}': {}", path, e))?;
        let mut config: Config = toml::from_str(&content)
            .map_err(|e| eyre::eyre!("Failed to parse config file '{}': {}", path, e))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Per-chain RPC endpoints can be overridden with `<NAME>_RPC_URLS`
    /// (comma-separated), e.g. `ETHEREUM_RPC_URLS=https://a,https://b`.
    fn apply_env_overrides(&mut self) {
        for chain in &mut self.chains {
            let var = format!("{}_RPC_URLS", chain.name.to_uppercase().replace('-', "_"));
            if let Ok(urls) = std::env::var(&var) {
                let urls: Vec<String> = urls
                    .split(',')
                    .map(|u| u.trim().to_string())
                    .filter(|u| !u.is_empty())
                    .collect();
                if !urls.is_empty() {
                    tracing::info!(
                        chain = %chain.name,
                        %var,
                        count = urls.len(),
                        "RPC endpoints overridden from environment"
                    );
                    chain.rpc_urls = urls;
                }
            }
        }
    }

    /// The chains this process should crawl. When `NETWORK` is set, only the
    /// chain whose name or chain id matches it is active.
    pub fn active_chains(&self) -> eyre::Result<Vec<ChainConfig>> {
        match std::env::var("NETWORK") {
            Ok(selector) if !selector.trim().is_empty() => {
                let selector = selector.trim();
                let selected: Vec<ChainConfig> = self
                    .chains
                    .iter()
                    .filter(|c| c.name.eq_ignore_ascii_case(selector) || c.chain_id == selector)
                    .cloned()
                    .collect();
                if selected.is_empty() {
                    return Err(eyre::eyre!(
                        "NETWORK='{}' does not match any configured chain",
                        selector
                    ));
                }
                Ok(selected)
            }
            _ => Ok(self.chains.clone()),
        }
    }

    fn validate(&self) -> eyre::Result<()> {
        if self.chains.is_empty() {
            return Err(eyre::eyre!("At least one chain must be configured"));
        }
        let mut seen = std::collections::HashSet::new();
        for chain in &self.chains {
            if !seen.insert(chain.chain_id.clone()) {
                return Err(eyre::eyre!("Duplicate chain_id '{}'", chain.chain_id));
            }
            if chain.rpc_urls.is_empty() {
                return Err(eyre::eyre!(
                    "Chain '{}' must have at least one RPC endpoint",
                    chain.name
                ));
            }
            if !chain.contract_address.starts_with("0x") || chain.contract_address.len() != 42 {
                return Err(eyre::eyre!(
                    "Invalid contract address '{}' on chain '{}'",
                    chain.contract_address,
                    chain.name
                ));
            }
            if chain.start_block == 0 {
                return Err(eyre::eyre!(
                    "Chain '{}': start_block must be > 0",
                    chain.name
                ));
            }
            if chain.required_confirmations == 0 || chain.reorg_depth == 0 {
                return Err(eyre::eyre!(
                    "Chain '{}': required_confirmations and reorg_depth must be > 0",
                    chain.name
                ));
            }
            if chain.batch_size == 0 {
                return Err(eyre::eyre!("Chain '{}': batch_size must be > 0", chain.name));
            }
            if chain.reorg_depth < chain.required_confirmations {
                tracing::warn!(
                    chain = %chain.name,
                    reorg_depth = chain.reorg_depth,
                    required_confirmations = chain.required_confirmations,
                    "reorg_depth below required_confirmations; confirmed rows may survive undetected reorgs"
                );
            }
        }
        Ok(())
    }
}
