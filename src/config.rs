use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use eyre::{eyre, Result, WrapErr};
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::bounded_cache::{DEFAULT_PROPOSAL_CACHE_SIZE, DEFAULT_PROPOSAL_CACHE_TTL_SECS};
use crate::bridge::HandlerSet;
use crate::connection::Keypair;
use crate::gas::{EgsOracle, EgsSpeed, GasPricer, GasStrategy};
use crate::listener::ListenerConfig;
use crate::retry::RetryConfig;
use crate::types::ChainId;
use crate::writer::WriterConfig;

const GWEI: u128 = 1_000_000_000;

/// Environment variable holding the keystore password
pub const KEYSTORE_PASSWORD_ENV: &str = "KEYSTORE_PASSWORD";

/// Configuration for one chain runtime
#[derive(Clone, Deserialize)]
pub struct ChainConfig {
    /// Bridge-level chain id (not the EIP-155 id)
    pub id: ChainId,
    pub name: String,
    /// HTTP JSON-RPC endpoint
    pub endpoint: String,
    /// Relayer account; selects the keystore file when no private key is set
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default = "default_keystore_path")]
    pub keystore_path: String,
    pub bridge_address: String,
    #[serde(default)]
    pub erc20_handler: Option<String>,
    #[serde(default)]
    pub erc721_handler: Option<String>,
    #[serde(default)]
    pub generic_handler: Option<String>,
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    #[serde(default = "default_max_gas_price")]
    pub max_gas_price: u128,
    #[serde(default)]
    pub min_gas_price: u128,
    #[serde(default = "default_gas_multiplier")]
    pub gas_multiplier: f64,
    /// Fixed gas price; disables node and gas station pricing
    #[serde(default)]
    pub gas_price: Option<u128>,
    #[serde(default)]
    pub egs_api_key: Option<String>,
    #[serde(default = "default_egs_speed")]
    pub egs_speed: String,
    #[serde(default)]
    pub start_block: u64,
    /// Ignore the stored checkpoint and start from `start_block`
    #[serde(default)]
    pub fresh_start: bool,
    /// Start from the current chain head
    #[serde(default)]
    pub latest_block: bool,
    #[serde(default = "default_block_confirmations")]
    pub block_confirmations: u64,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_block_retry_limit")]
    pub block_retry_limit: u32,
    #[serde(default = "default_block_retry_interval")]
    pub block_retry_interval_ms: u64,
    #[serde(default = "default_tx_retry_limit")]
    pub tx_retry_limit: u32,
    #[serde(default = "default_tx_retry_interval")]
    pub tx_retry_interval_ms: u64,
    #[serde(default = "default_blockstore_path")]
    pub blockstore_path: String,
    /// Postgres URL; the file blockstore is used when unset
    #[serde(default)]
    pub checkpoint_database_url: Option<String>,
    #[serde(default)]
    pub verify_chain_id: bool,
    #[serde(default = "default_proposal_cache_size")]
    pub proposal_cache_size: usize,
    #[serde(default = "default_proposal_cache_ttl")]
    pub proposal_cache_ttl_secs: u64,
}

/// Custom Debug that redacts key material and the database URL (may contain credentials).
impl fmt::Debug for ChainConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("from", &self.from)
            .field(
                "private_key",
                &self.private_key.as_ref().map(|_| "<redacted>"),
            )
            .field("keystore_path", &self.keystore_path)
            .field("bridge_address", &self.bridge_address)
            .field("erc20_handler", &self.erc20_handler)
            .field("erc721_handler", &self.erc721_handler)
            .field("generic_handler", &self.generic_handler)
            .field("gas_limit", &self.gas_limit)
            .field("max_gas_price", &self.max_gas_price)
            .field("min_gas_price", &self.min_gas_price)
            .field("gas_multiplier", &self.gas_multiplier)
            .field("gas_price", &self.gas_price)
            .field(
                "egs_api_key",
                &self.egs_api_key.as_ref().map(|_| "<redacted>"),
            )
            .field("egs_speed", &self.egs_speed)
            .field("start_block", &self.start_block)
            .field("fresh_start", &self.fresh_start)
            .field("latest_block", &self.latest_block)
            .field("block_confirmations", &self.block_confirmations)
            .field("max_batch_size", &self.max_batch_size)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("block_retry_limit", &self.block_retry_limit)
            .field("block_retry_interval_ms", &self.block_retry_interval_ms)
            .field("tx_retry_limit", &self.tx_retry_limit)
            .field("tx_retry_interval_ms", &self.tx_retry_interval_ms)
            .field("blockstore_path", &self.blockstore_path)
            .field(
                "checkpoint_database_url",
                &self.checkpoint_database_url.as_ref().map(|_| "<redacted>"),
            )
            .field("verify_chain_id", &self.verify_chain_id)
            .finish()
    }
}

/// Default functions
fn default_keystore_path() -> String {
    "./keys".to_string()
}

fn default_gas_limit() -> u64 {
    6_721_975
}

fn default_max_gas_price() -> u128 {
    20 * GWEI
}

fn default_gas_multiplier() -> f64 {
    1.0
}

fn default_egs_speed() -> String {
    EgsSpeed::default().to_string()
}

fn default_block_confirmations() -> u64 {
    10
}

fn default_max_batch_size() -> u64 {
    100
}

fn default_poll_interval() -> u64 {
    5000
}

fn default_block_retry_limit() -> u32 {
    5
}

fn default_block_retry_interval() -> u64 {
    5000
}

fn default_tx_retry_limit() -> u32 {
    10
}

fn default_tx_retry_interval() -> u64 {
    2000
}

fn default_blockstore_path() -> String {
    "./blockstore".to_string()
}

fn default_proposal_cache_size() -> usize {
    DEFAULT_PROPOSAL_CACHE_SIZE
}

fn default_proposal_cache_ttl() -> u64 {
    DEFAULT_PROPOSAL_CACHE_TTL_SECS
}

fn required_env(name: &str) -> Result<String> {
    env::var(name).map_err(|_| eyre!("{} environment variable is required", name))
}

/// Parse an optional variable, falling back to `default` when unset
fn env_or<T: FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| eyre!("{} has an invalid value {:?}: {}", name, raw, e)),
        Err(_) => Ok(default),
    }
}

fn env_opt<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: fmt::Display,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| eyre!("{} has an invalid value {:?}: {}", name, raw, e)),
        _ => Ok(None),
    }
}

fn parse_address(field: &str, value: &str) -> Result<Address> {
    let address: Address = value
        .parse()
        .map_err(|_| eyre!("{} must be a valid hex address (42 chars with 0x prefix)", field))?;
    if address == Address::ZERO {
        return Err(eyre!("{} cannot be the zero address", field));
    }
    Ok(address)
}

impl ChainConfig {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env")
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Self> {
        let id: u8 = required_env("CHAIN_ID")?
            .parse()
            .wrap_err("CHAIN_ID must be a valid u8")?;

        let config = ChainConfig {
            id: ChainId(id),
            name: required_env("CHAIN_NAME")?,
            endpoint: required_env("CHAIN_RPC_URL")?,
            from: env_opt("CHAIN_FROM")?,
            private_key: env_opt("CHAIN_PRIVATE_KEY")?,
            keystore_path: env_or("KEYSTORE_PATH", default_keystore_path())?,
            bridge_address: required_env("CHAIN_BRIDGE_ADDRESS")?,
            erc20_handler: env_opt("CHAIN_ERC20_HANDLER")?,
            erc721_handler: env_opt("CHAIN_ERC721_HANDLER")?,
            generic_handler: env_opt("CHAIN_GENERIC_HANDLER")?,
            gas_limit: env_or("CHAIN_GAS_LIMIT", default_gas_limit())?,
            max_gas_price: env_or("CHAIN_MAX_GAS_PRICE", default_max_gas_price())?,
            min_gas_price: env_or("CHAIN_MIN_GAS_PRICE", 0)?,
            gas_multiplier: env_or("CHAIN_GAS_MULTIPLIER", default_gas_multiplier())?,
            gas_price: env_opt("CHAIN_GAS_PRICE")?,
            egs_api_key: env_opt("CHAIN_EGS_API_KEY")?,
            egs_speed: env_or("CHAIN_EGS_SPEED", default_egs_speed())?,
            start_block: env_or("CHAIN_START_BLOCK", 0)?,
            fresh_start: env_or("CHAIN_FRESH_START", false)?,
            latest_block: env_or("CHAIN_LATEST_BLOCK", false)?,
            block_confirmations: env_or(
                "CHAIN_BLOCK_CONFIRMATIONS",
                default_block_confirmations(),
            )?,
            max_batch_size: env_or("CHAIN_MAX_BATCH_SIZE", default_max_batch_size())?,
            poll_interval_ms: env_or("CHAIN_POLL_INTERVAL_MS", default_poll_interval())?,
            block_retry_limit: env_or("CHAIN_BLOCK_RETRY_LIMIT", default_block_retry_limit())?,
            block_retry_interval_ms: env_or(
                "CHAIN_BLOCK_RETRY_INTERVAL_MS",
                default_block_retry_interval(),
            )?,
            tx_retry_limit: env_or("CHAIN_TX_RETRY_LIMIT", default_tx_retry_limit())?,
            tx_retry_interval_ms: env_or(
                "CHAIN_TX_RETRY_INTERVAL_MS",
                default_tx_retry_interval(),
            )?,
            blockstore_path: env_or("BLOCKSTORE_PATH", default_blockstore_path())?,
            checkpoint_database_url: env_opt("CHECKPOINT_DATABASE_URL")?,
            verify_chain_id: env_or("CHAIN_VERIFY_ID", false)?,
            proposal_cache_size: env_or(
                "CHAIN_PROPOSAL_CACHE_SIZE",
                default_proposal_cache_size(),
            )?,
            proposal_cache_ttl_secs: env_or(
                "CHAIN_PROPOSAL_CACHE_TTL_SECS",
                default_proposal_cache_ttl(),
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(eyre!("chain name cannot be empty"));
        }

        if self.endpoint.is_empty() {
            return Err(eyre!("{}: endpoint cannot be empty", self.name));
        }

        parse_address("bridge_address", &self.bridge_address)
            .wrap_err_with(|| format!("chain {}", self.name))?;
        self.handlers()?;

        match (&self.private_key, &self.from) {
            (Some(key), _) => {
                let hex = key.strip_prefix("0x").unwrap_or(key);
                if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(eyre!(
                        "{}: private_key must be 64 hex chars (optionally 0x-prefixed)",
                        self.name
                    ));
                }
            }
            (None, Some(from)) => {
                parse_address("from", from).wrap_err_with(|| format!("chain {}", self.name))?;
            }
            (None, None) => {
                return Err(eyre!(
                    "{}: either private_key or from (keystore account) is required",
                    self.name
                ));
            }
        }

        if self.gas_multiplier.is_nan() || self.gas_multiplier <= 0.0 {
            return Err(eyre!("{}: gas_multiplier must be positive", self.name));
        }

        if self.max_gas_price != 0 && self.min_gas_price > self.max_gas_price {
            return Err(eyre!(
                "{}: min_gas_price ({}) exceeds max_gas_price ({})",
                self.name,
                self.min_gas_price,
                self.max_gas_price
            ));
        }

        if self.gas_limit == 0 {
            return Err(eyre!("{}: gas_limit cannot be 0", self.name));
        }

        if self.max_batch_size == 0 {
            return Err(eyre!("{}: max_batch_size cannot be 0", self.name));
        }

        if self.block_retry_limit == 0 || self.tx_retry_limit == 0 {
            return Err(eyre!("{}: retry limits cannot be 0", self.name));
        }

        if self.proposal_cache_size == 0 {
            return Err(eyre!("{}: proposal_cache_size cannot be 0", self.name));
        }

        self.egs_speed
            .parse::<EgsSpeed>()
            .map_err(|e| eyre!("{}: {}", self.name, e))?;

        Ok(())
    }

    pub fn bridge(&self) -> Result<Address> {
        parse_address("bridge_address", &self.bridge_address)
    }

    pub fn handlers(&self) -> Result<HandlerSet> {
        let parse = |field: &str, value: &Option<String>| -> Result<Option<Address>> {
            value
                .as_deref()
                .map(|v| parse_address(field, v))
                .transpose()
                .wrap_err_with(|| format!("chain {}", self.name))
        };
        Ok(HandlerSet {
            erc20: parse("erc20_handler", &self.erc20_handler)?,
            erc721: parse("erc721_handler", &self.erc721_handler)?,
            generic: parse("generic_handler", &self.generic_handler)?,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn listener_config(&self) -> Result<ListenerConfig> {
        Ok(ListenerConfig {
            confirmations: self.block_confirmations,
            max_batch_size: self.max_batch_size,
            poll_interval: self.poll_interval(),
            retry: RetryConfig::with_limit(
                self.block_retry_limit,
                Duration::from_millis(self.block_retry_interval_ms),
            ),
            handlers: self.handlers()?,
        })
    }

    pub fn writer_config(&self) -> Result<WriterConfig> {
        Ok(WriterConfig {
            handlers: self.handlers()?,
            retry: RetryConfig::with_limit(
                self.tx_retry_limit,
                Duration::from_millis(self.tx_retry_interval_ms),
            ),
            proposal_cache_size: self.proposal_cache_size,
            proposal_cache_ttl: Duration::from_secs(self.proposal_cache_ttl_secs),
        })
    }

    pub fn gas_strategy(&self) -> GasStrategy {
        match self.gas_price {
            Some(price) => GasStrategy::Fixed(price),
            None => GasStrategy::Dynamic {
                multiplier: self.gas_multiplier,
                min: self.min_gas_price,
                max: self.max_gas_price,
            },
        }
    }

    /// Gas pricer, backed by the gas station when an API key is configured
    pub fn gas_pricer(&self) -> Result<GasPricer> {
        let pricer = GasPricer::new(self.gas_strategy());
        match &self.egs_api_key {
            Some(api_key) if self.gas_price.is_none() => {
                let speed = self
                    .egs_speed
                    .parse::<EgsSpeed>()
                    .map_err(|e| eyre!("{}", e))?;
                let oracle =
                    EgsOracle::new(api_key.clone(), speed).map_err(|e| eyre!("{}", e))?;
                Ok(pricer.with_source(Arc::new(oracle)))
            }
            _ => Ok(pricer),
        }
    }

    /// Path of the encrypted keystore for the `from` account
    pub fn keystore_file(&self) -> Option<PathBuf> {
        self.from
            .as_ref()
            .map(|from| Path::new(&self.keystore_path).join(format!("{}.key", from)))
    }

    /// Relayer signing key, from the private key or the encrypted keystore.
    ///
    /// The keystore password is read from `KEYSTORE_PASSWORD`.
    pub fn keypair(&self) -> Result<Keypair> {
        if let Some(key) = &self.private_key {
            let signer: PrivateKeySigner = key
                .parse()
                .map_err(|_| eyre!("{}: private_key is not a valid secp256k1 key", self.name))?;
            return Ok(Keypair::new(signer));
        }

        let path = self
            .keystore_file()
            .ok_or_else(|| eyre!("{}: no key material configured", self.name))?;
        let password = required_env(KEYSTORE_PASSWORD_ENV)?;
        let signer = PrivateKeySigner::decrypt_keystore(&path, password)
            .map_err(|e| eyre!("failed to decrypt keystore {}: {}", path.display(), e))?;

        if let Some(from) = &self.from {
            let expected = parse_address("from", from)?;
            if signer.address() != expected {
                return Err(eyre!(
                    "keystore {} holds {}, expected {}",
                    path.display(),
                    signer.address(),
                    expected
                ));
            }
        }

        Ok(Keypair::new(signer))
    }
}

/// Configuration for every chain served by one relayer process
#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    pub chains: Vec<ChainConfig>,
}

impl RelayerConfig {
    /// Load a JSON file with a `chains` array
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read config file {}", path.display()))?;
        let config: RelayerConfig = serde_json::from_str(&raw)
            .wrap_err_with(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chains.is_empty() {
            return Err(eyre!("at least one chain must be configured"));
        }

        let mut ids = HashSet::new();
        for chain in &self.chains {
            chain.validate()?;
            // Two runtimes for one chain id would share a checkpoint
            if !ids.insert(chain.id) {
                return Err(eyre!("chain id {} is configured more than once", chain.id));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0x0000000000000000000000000000000000000000000000000000000000000001";

    fn config() -> ChainConfig {
        serde_json::from_value(serde_json::json!({
            "id": 1,
            "name": "ethereum",
            "endpoint": "http://localhost:8545",
            "private_key": KEY,
            "bridge_address": "0x0000000000000000000000000000000000000b01",
            "erc20_handler": "0x0000000000000000000000000000000000000e20",
        }))
        .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = config();
        assert_eq!(config.gas_limit, 6_721_975);
        assert_eq!(config.max_gas_price, 20 * GWEI);
        assert_eq!(config.min_gas_price, 0);
        assert_eq!(config.block_confirmations, 10);
        assert_eq!(config.max_batch_size, 100);
        assert_eq!(config.block_retry_limit, 5);
        assert_eq!(config.tx_retry_limit, 10);
        assert_eq!(config.keystore_path, "./keys");
        assert_eq!(config.blockstore_path, "./blockstore");
        assert_eq!(config.egs_speed, "fast");
        assert!(!config.verify_chain_id);
        assert!(!config.fresh_start);
        config.validate().unwrap();
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut config = config();
        config.egs_api_key = Some("egs-secret".into());
        config.checkpoint_database_url = Some("postgres://user:pw@localhost/db".into());

        let debug = format!("{:?}", config);
        assert!(!debug.contains("0000000000000000000000000000000000000000000000000000000000000001"));
        assert!(!debug.contains("egs-secret"));
        assert!(!debug.contains("user:pw"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_validate_rejects_bad_addresses() {
        let mut config = config();
        config.bridge_address = "0x1234".into();
        assert!(config.validate().is_err());

        let mut config = self::config();
        config.bridge_address = format!("{}", Address::ZERO);
        assert!(config.validate().is_err());

        let mut config = self::config();
        config.erc721_handler = Some("not-an-address".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_key_material() {
        let mut config = config();
        config.private_key = None;
        assert!(config.validate().is_err());

        config.from = Some("0x7e5f4552091a69125d5dfcb7b8c2659029395bdf".into());
        config.validate().unwrap();

        config.private_key = Some("0x1234".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_gas_settings() {
        let mut config = config();
        config.min_gas_price = 30 * GWEI;
        assert!(config.validate().is_err());

        let mut config = self::config();
        config.gas_multiplier = 0.0;
        assert!(config.validate().is_err());

        let mut config = self::config();
        config.egs_speed = "slow".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut config = config();
        config.max_batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = self::config();
        config.tx_retry_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_gas_strategy() {
        let mut config = config();
        assert_eq!(
            config.gas_strategy(),
            GasStrategy::Dynamic {
                multiplier: 1.0,
                min: 0,
                max: 20 * GWEI,
            }
        );

        config.gas_price = Some(3 * GWEI);
        assert_eq!(config.gas_strategy(), GasStrategy::Fixed(3 * GWEI));
    }

    #[test]
    fn test_component_configs() {
        let config = config();
        let listener = config.listener_config().unwrap();
        assert_eq!(listener.confirmations, 10);
        assert_eq!(listener.poll_interval, Duration::from_secs(5));
        assert_eq!(listener.retry.max_retries, 5);
        assert_eq!(
            listener.handlers.erc20,
            Some("0x0000000000000000000000000000000000000e20".parse().unwrap())
        );

        let writer = config.writer_config().unwrap();
        assert_eq!(writer.retry.max_retries, 10);
        assert_eq!(writer.retry.initial_backoff, Duration::from_secs(2));
        assert_eq!(writer.proposal_cache_size, DEFAULT_PROPOSAL_CACHE_SIZE);
    }

    #[test]
    fn test_keypair_from_private_key() {
        let keypair = config().keypair().unwrap();
        // Address of secret key 1
        assert_eq!(
            keypair.address(),
            "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf"
                .parse::<Address>()
                .unwrap()
        );
    }

    #[test]
    fn test_keystore_file() {
        let mut config = config();
        config.from = Some("0xabc".into());
        config.keystore_path = "/etc/relayer/keys".into();
        assert_eq!(
            config.keystore_file(),
            Some(PathBuf::from("/etc/relayer/keys/0xabc.key"))
        );
    }

    #[test]
    fn test_relayer_config_rejects_duplicate_ids() {
        let relayer = RelayerConfig {
            chains: vec![config(), config()],
        };
        assert!(relayer.validate().is_err());

        let mut second = config();
        second.id = ChainId(2);
        second.name = "bsc".into();
        let relayer = RelayerConfig {
            chains: vec![config(), second],
        };
        relayer.validate().unwrap();
    }
}
