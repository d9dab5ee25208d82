//! EVM connection over an HTTP JSON-RPC endpoint
//!
//! Wraps an alloy provider with the relayer's wallet attached. Transactions
//! are built with explicit nonce, gas price and gas limit; the provider does
//! not fill them.

use alloy::{
    network::{Ethereum, EthereumWallet},
    primitives::Address,
    providers::{
        fillers::{FillProvider, JoinFill, WalletFiller},
        Identity, Provider, ProviderBuilder, RootProvider,
    },
    rpc::types::Filter,
    transports::http::{Client, Http},
};
use async_trait::async_trait;
use std::fmt::Display;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use super::{CallOpts, ChainLog, Connection, Keypair, LogFilter, TransactOpts};
use crate::error::{ChainError, Result};
use crate::stop::StopSignal;

/// Provider with the relayer wallet attached
pub type SignerProvider = FillProvider<
    JoinFill<Identity, WalletFiller<EthereumWallet>>,
    RootProvider<Http<Client>>,
    Http<Client>,
    Ethereum,
>;

pub(crate) fn rpc_err(e: impl Display) -> ChainError {
    ChainError::Rpc(e.to_string())
}

pub struct EvmConnection {
    endpoint: String,
    keypair: Keypair,
    provider: SignerProvider,
    opts: Mutex<TransactOpts>,
    poll_interval: Duration,
    /// Fired by `close`; wakes pending waits
    closed: StopSignal,
}

impl EvmConnection {
    pub fn new(
        endpoint: &str,
        keypair: Keypair,
        gas_limit: u64,
        poll_interval: Duration,
    ) -> Result<Self> {
        let wallet = EthereumWallet::from(keypair.signer().clone());
        let url = endpoint
            .parse()
            .map_err(|e| ChainError::Config(format!("invalid RPC URL {}: {}", endpoint, e)))?;
        let provider = ProviderBuilder::new().wallet(wallet).on_http(url);

        let opts = TransactOpts {
            from: keypair.address(),
            nonce: 0,
            gas_price: 0,
            gas_limit,
            chain_id: 0,
        };

        Ok(Self {
            endpoint: endpoint.to_string(),
            keypair,
            provider,
            opts: Mutex::new(opts),
            poll_interval,
            closed: StopSignal::new(),
        })
    }

    /// Provider with the relayer wallet attached, for contract bindings
    pub fn provider(&self) -> SignerProvider {
        self.provider.clone()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.is_stopped() {
            return Err(ChainError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for EvmConnection {
    async fn connect(&self) -> Result<()> {
        self.ensure_open()?;
        info!(endpoint = %self.endpoint, "Connecting to chain");

        let chain_id = self.provider.get_chain_id().await.map_err(rpc_err)?;
        let nonce = self
            .provider
            .get_transaction_count(self.keypair.address())
            .pending()
            .await
            .map_err(rpc_err)?;

        let mut opts = self.opts.lock().await;
        opts.chain_id = chain_id;
        opts.nonce = nonce;

        info!(
            chain_id,
            from = %self.keypair.address(),
            nonce,
            "Connected to chain"
        );
        Ok(())
    }

    fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    async fn lock_and_update_opts(&self) -> Result<MutexGuard<'_, TransactOpts>> {
        self.ensure_open()?;
        let mut opts = self.opts.lock().await;
        let from = opts.from;
        opts.nonce = self
            .provider
            .get_transaction_count(from)
            .pending()
            .await
            .map_err(rpc_err)?;
        Ok(opts)
    }

    fn call_opts(&self) -> CallOpts {
        CallOpts {
            from: self.keypair.address(),
        }
    }

    async fn ensure_has_bytecode(&self, address: Address) -> Result<()> {
        self.ensure_open()?;
        let code = self.provider.get_code_at(address).await.map_err(rpc_err)?;
        if code.is_empty() {
            return Err(ChainError::MissingBytecode(address));
        }
        debug!(%address, size = code.len(), "Contract bytecode present");
        Ok(())
    }

    async fn latest_block(&self) -> Result<u64> {
        self.ensure_open()?;
        self.provider.get_block_number().await.map_err(rpc_err)
    }

    async fn wait_for_block(&self, block: u64, delay: u64) -> Result<()> {
        let target = block.saturating_add(delay);
        loop {
            let latest = self.latest_block().await?;
            if latest >= target {
                return Ok(());
            }
            debug!(latest, target, "Waiting for block");
            if !self.closed.sleep(self.poll_interval).await {
                return Err(ChainError::Closed);
            }
        }
    }

    async fn filter_logs(&self, filter: &LogFilter) -> Result<Vec<ChainLog>> {
        self.ensure_open()?;
        let rpc_filter = Filter::new()
            .address(filter.addresses.clone())
            .event_signature(filter.topics.clone())
            .from_block(filter.from_block)
            .to_block(filter.to_block);

        let logs = self.provider.get_logs(&rpc_filter).await.map_err(|e| {
            ChainError::Rpc(format!(
                "failed to get logs from block {} to {}: {}",
                filter.from_block, filter.to_block, e
            ))
        })?;

        logs.into_iter()
            .map(|log| -> Result<ChainLog> {
                let block_number = log
                    .block_number
                    .ok_or_else(|| ChainError::Rpc("log without block number".into()))?;
                Ok(ChainLog {
                    address: log.address(),
                    topics: log.topics().to_vec(),
                    data: log.data().data.clone(),
                    block_number,
                    log_index: log.log_index.unwrap_or_default(),
                    tx_hash: log.transaction_hash,
                })
            })
            .collect()
    }

    async fn suggest_gas_price(&self) -> Result<u128> {
        self.ensure_open()?;
        self.provider.get_gas_price().await.map_err(rpc_err)
    }

    fn close(&self) {
        if !self.closed.is_stopped() {
            info!(endpoint = %self.endpoint, "Connection closed");
        }
        self.closed.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::signers::local::PrivateKeySigner;

    fn unreachable_connection(poll_interval: Duration) -> EvmConnection {
        EvmConnection::new(
            "http://127.0.0.1:1",
            Keypair::new(PrivateKeySigner::random()),
            6_721_975,
            poll_interval,
        )
        .unwrap()
    }

    #[test]
    fn test_invalid_endpoint_is_config_error() {
        let result = EvmConnection::new(
            "not a url",
            Keypair::new(PrivateKeySigner::random()),
            6_721_975,
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(ChainError::Config(_))));
    }

    #[tokio::test]
    async fn test_closed_connection_refuses_calls() {
        let conn = unreachable_connection(Duration::from_secs(60));
        conn.close();
        conn.close();

        assert!(matches!(conn.latest_block().await, Err(ChainError::Closed)));
        assert!(matches!(
            conn.wait_for_block(100, 10).await,
            Err(ChainError::Closed)
        ));
        assert!(matches!(
            conn.lock_and_update_opts().await,
            Err(ChainError::Closed)
        ));
    }
}
