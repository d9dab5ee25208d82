//! Chain relayer - per-chain runtime for ChainBridge-style bridge relayers
//!
//! Each [`chain::ChainRuntime`] watches one EVM chain for bridge events, hands
//! them to a cross-chain [`router::Router`], and submits votes and executions for
//! messages the router routes back to it.

pub mod bounded_cache;
pub mod bridge;
pub mod chain;
pub mod checkpoint;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod gas;
pub mod hash;
pub mod listener;
pub mod metrics;
pub mod pending;
pub mod proposal;
pub mod retry;
pub mod router;
pub mod stop;
pub mod types;
pub mod writer;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use chain::ChainRuntime;
pub use config::{ChainConfig, RelayerConfig};
pub use error::{ChainError, SystemError};
pub use types::{ChainId, DepositNonce, Message, MessageKind, ResourceId};
