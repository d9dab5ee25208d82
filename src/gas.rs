//! Gas price strategy for bridge transactions
//!
//! A fixed price, or a dynamic price taken from an external oracle (falling
//! back to the node's suggestion), scaled by a multiplier and clamped to the
//! configured bounds.

use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::{ChainError, Result};
use crate::retry::RetryConfig;

const EGS_URL: &str = "https://data-api.defipulse.com/api/v1/egs/api/ethgasAPI.json";
/// Gas station prices are quoted in units of 0.1 gwei
const EGS_UNIT_WEI: f64 = 100_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GasStrategy {
    Fixed(u128),
    Dynamic { multiplier: f64, min: u128, max: u128 },
}

impl GasStrategy {
    /// Apply multiplier and bounds to a base price
    pub fn apply(&self, base: u128) -> u128 {
        match *self {
            GasStrategy::Fixed(price) => price,
            GasStrategy::Dynamic {
                multiplier,
                min,
                max,
            } => {
                let scaled = (base as f64 * multiplier) as u128;
                clamp(scaled, min, max)
            }
        }
    }
}

fn clamp(price: u128, min: u128, max: u128) -> u128 {
    let price = price.max(min);
    if max > 0 {
        price.min(max)
    } else {
        price
    }
}

/// External gas price feed
#[async_trait]
pub trait GasPriceSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Current price in wei
    async fn gas_price(&self) -> Result<u128>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EgsSpeed {
    Average,
    #[default]
    Fast,
    Fastest,
}

impl FromStr for EgsSpeed {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "average" => Ok(EgsSpeed::Average),
            "fast" => Ok(EgsSpeed::Fast),
            "fastest" => Ok(EgsSpeed::Fastest),
            other => Err(ChainError::Config(format!("unknown gas station speed {}", other))),
        }
    }
}

impl fmt::Display for EgsSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EgsSpeed::Average => write!(f, "average"),
            EgsSpeed::Fast => write!(f, "fast"),
            EgsSpeed::Fastest => write!(f, "fastest"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EgsResponse {
    average: f64,
    fast: f64,
    fastest: f64,
}

impl EgsResponse {
    fn price_wei(&self, speed: EgsSpeed) -> u128 {
        let units = match speed {
            EgsSpeed::Average => self.average,
            EgsSpeed::Fast => self.fast,
            EgsSpeed::Fastest => self.fastest,
        };
        (units * EGS_UNIT_WEI) as u128
    }
}

/// Eth Gas Station price feed
pub struct EgsOracle {
    client: reqwest::Client,
    url: String,
    api_key: String,
    speed: EgsSpeed,
}

impl EgsOracle {
    pub fn new(api_key: String, speed: EgsSpeed) -> Result<Self> {
        Self::with_url(EGS_URL.to_string(), api_key, speed)
    }

    pub fn with_url(url: String, api_key: String, speed: EgsSpeed) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ChainError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url,
            api_key,
            speed,
        })
    }
}

#[async_trait]
impl GasPriceSource for EgsOracle {
    fn name(&self) -> &'static str {
        "egs"
    }

    async fn gas_price(&self) -> Result<u128> {
        let response: EgsResponse = self
            .client
            .get(&self.url)
            .query(&[("api-key", self.api_key.as_str())])
            .send()
            .await
            .map_err(|e| ChainError::Rpc(format!("gas station request failed: {}", e)))?
            .error_for_status()
            .map_err(|e| ChainError::Rpc(format!("gas station request failed: {}", e)))?
            .json()
            .await
            .map_err(|e| ChainError::Rpc(format!("invalid gas station response: {}", e)))?;

        let price = response.price_wei(self.speed);
        debug!(speed = %self.speed, price, "Gas station price");
        Ok(price)
    }
}

/// Computes the gas price for each transaction attempt
#[derive(Clone)]
pub struct GasPricer {
    strategy: GasStrategy,
    source: Option<Arc<dyn GasPriceSource>>,
    bump: RetryConfig,
}

impl GasPricer {
    pub fn new(strategy: GasStrategy) -> Self {
        Self {
            strategy,
            source: None,
            bump: RetryConfig::default(),
        }
    }

    pub fn with_source(mut self, source: Arc<dyn GasPriceSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn strategy(&self) -> GasStrategy {
        self.strategy
    }

    /// Gas price for a submission, bumped `bumps` times after underpriced rejections
    pub async fn gas_price(&self, conn: &dyn Connection, bumps: u32) -> Result<u128> {
        let (min, max) = match self.strategy {
            GasStrategy::Fixed(price) => return Ok(price),
            GasStrategy::Dynamic { min, max, .. } => (min, max),
        };

        let base = match &self.source {
            Some(source) => match source.gas_price().await {
                Ok(price) => price,
                Err(e) => {
                    warn!(source = source.name(), error = %e, "External gas price unavailable, using node price");
                    conn.suggest_gas_price().await?
                }
            },
            None => conn.suggest_gas_price().await?,
        };

        let price = self.strategy.apply(base);
        Ok(clamp(self.bump.gas_price_for_attempt(price, bumps), min, max))
    }
}
