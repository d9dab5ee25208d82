//! Chain connection capability
//!
//! The listener and writer only talk to a chain through [`Connection`]. The
//! EVM implementation lives in [`evm`]; tests use an in-memory double.

pub mod evm;

use alloy::primitives::{Address, Bytes, B256};
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use std::fmt;
use tokio::sync::MutexGuard;

use crate::error::Result;

pub use evm::EvmConnection;

/// Signing key material for the relayer account
#[derive(Clone)]
pub struct Keypair {
    signer: PrivateKeySigner,
}

impl Keypair {
    pub fn new(signer: PrivateKeySigner) -> Self {
        Self { signer }
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn signer(&self) -> &PrivateKeySigner {
        &self.signer
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("address", &self.address())
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Options for a state-changing transaction from the relayer account.
///
/// Only reachable through the guard returned by
/// [`Connection::lock_and_update_opts`], so a nonce is never shared by two
/// transactions in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactOpts {
    pub from: Address,
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
    /// Native (EIP-155) chain id used for signing
    pub chain_id: u64,
}

/// Options for read-only contract calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOpts {
    pub from: Address,
}

/// Server-side log filter for a block range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub from_block: u64,
    pub to_block: u64,
    pub addresses: Vec<Address>,
    /// Accepted topic0 values
    pub topics: Vec<B256>,
}

/// A log entry as returned by the node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub log_index: u64,
    pub tx_hash: Option<B256>,
}

/// RPC session with one chain on behalf of one relayer account
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open the session and initialise the transaction options
    async fn connect(&self) -> Result<()>;

    fn keypair(&self) -> &Keypair;

    /// Exclusively lock the transaction options and refresh the pending nonce.
    ///
    /// The lock is released when the guard is dropped.
    async fn lock_and_update_opts(&self) -> Result<MutexGuard<'_, TransactOpts>>;

    fn call_opts(&self) -> CallOpts;

    /// Fail with `MissingBytecode` if nothing is deployed at `address`
    async fn ensure_has_bytecode(&self, address: Address) -> Result<()>;

    async fn latest_block(&self) -> Result<u64>;

    /// Resolve once the chain head reaches `block + delay`.
    ///
    /// Ends early with `Closed` when the connection is closed. It does not
    /// observe the runtime's stop signal; callers race it against that.
    async fn wait_for_block(&self, block: u64, delay: u64) -> Result<()>;

    async fn filter_logs(&self, filter: &LogFilter) -> Result<Vec<ChainLog>>;

    /// Gas price suggested by the node, in wei
    async fn suggest_gas_price(&self) -> Result<u128>;

    /// Close the session. Later calls fail with `Closed`.
    fn close(&self);
}
