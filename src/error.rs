//! Error taxonomy for the chain runtime
//!
//! Errors are grouped by how the runtime reacts to them:
//! startup errors abort construction, transient errors are retried,
//! decode errors skip a single event, and fatal errors are reported
//! upstream as a [`SystemError`].

use alloy::primitives::Address;
use thiserror::Error;

use crate::types::ChainId;

pub type Result<T, E = ChainError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Error)]
pub enum ChainError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("keystore error: {0}")]
    Keystore(String),

    #[error("no contract bytecode at {0}")]
    MissingBytecode(Address),

    #[error("bridge reports chain id {actual}, configured {expected}")]
    ChainIdMismatch { expected: ChainId, actual: ChainId },

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("failed to decode event: {0}")]
    Decode(String),

    #[error("chain head {head} is below committed height {committed}")]
    ReorgViolation { head: u64, committed: u64 },

    #[error("transaction submission failed: {0}")]
    Submission(String),

    #[error("router rejected message: {0}")]
    Router(String),

    #[error("state store error: {0}")]
    Checkpoint(String),

    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        last_error: String,
    },

    #[error("router must be set before start")]
    NotReady,

    #[error("chain runtime already started")]
    AlreadyStarted,

    #[error("connection closed")]
    Closed,
}

impl ChainError {
    /// Errors that compromise correctness and must halt the chain runtime
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ChainError::ReorgViolation { .. } | ChainError::RetriesExhausted { .. }
        )
    }

    /// Short label used for the `type` metric dimension
    pub fn label(&self) -> &'static str {
        match self {
            ChainError::Config(_) => "config",
            ChainError::Keystore(_) => "keystore",
            ChainError::MissingBytecode(_) => "missing_bytecode",
            ChainError::ChainIdMismatch { .. } => "chain_id_mismatch",
            ChainError::Rpc(_) => "rpc",
            ChainError::Decode(_) => "decode",
            ChainError::ReorgViolation { .. } => "reorg",
            ChainError::Submission(_) => "submission",
            ChainError::Router(_) => "router",
            ChainError::Checkpoint(_) => "checkpoint",
            ChainError::RetriesExhausted { .. } => "retries_exhausted",
            ChainError::NotReady => "not_ready",
            ChainError::AlreadyStarted => "already_started",
            ChainError::Closed => "closed",
        }
    }
}

/// Fatal error reported by a chain runtime to the owning process
#[derive(Debug, Clone, Error)]
#[error("chain {chain}: {error}")]
pub struct SystemError {
    pub chain: ChainId,
    #[source]
    pub error: ChainError,
}

/// Channel on which chain runtimes report fatal errors
pub type SystemErrorSender = tokio::sync::mpsc::UnboundedSender<SystemError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(ChainError::ReorgViolation {
            head: 10,
            committed: 20
        }
        .is_fatal());
        assert!(ChainError::RetriesExhausted {
            operation: "latest block",
            attempts: 5,
            last_error: "timeout".into()
        }
        .is_fatal());
        assert!(!ChainError::Rpc("timeout".into()).is_fatal());
        assert!(!ChainError::Decode("short data".into()).is_fatal());
    }

    #[test]
    fn test_system_error_display() {
        let err = SystemError {
            chain: ChainId(2),
            error: ChainError::ReorgViolation {
                head: 90,
                committed: 95,
            },
        };
        assert_eq!(
            err.to_string(),
            "chain 2: chain head 90 is below committed height 95"
        );
    }
}
