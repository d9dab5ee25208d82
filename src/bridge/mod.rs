//! Typed access to the bridge and handler contracts
//!
//! The listener resolves deposits through [`Bridge`]; the writer reads
//! proposal state and submits votes and executions through it.

pub mod contracts;
pub mod evm;

use alloy::primitives::{Address, Bytes, Uint, B256, U256};
use async_trait::async_trait;

use crate::connection::TransactOpts;
use crate::error::Result;
use crate::proposal::ProposalStatus;
use crate::types::{ChainId, DepositNonce, HandlerKind, MessageKind, ResourceId};

pub use evm::EvmBridge;

/// Deposit as recorded by a handler contract on the source chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepositRecord {
    Fungible {
        amount: U256,
        recipient: Bytes,
    },
    NonFungible {
        token_id: U256,
        recipient: Bytes,
        metadata: Bytes,
    },
    Generic {
        metadata: Bytes,
    },
}

impl DepositRecord {
    pub fn into_kind(self) -> MessageKind {
        match self {
            DepositRecord::Fungible { amount, recipient } => {
                MessageKind::FungibleTransfer { amount, recipient }
            }
            DepositRecord::NonFungible {
                token_id,
                recipient,
                metadata,
            } => MessageKind::NonFungibleTransfer {
                token_id,
                recipient,
                metadata,
            },
            DepositRecord::Generic { metadata } => MessageKind::GenericTransfer { metadata },
        }
    }
}

/// Handler contracts configured for this chain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerSet {
    pub erc20: Option<Address>,
    pub erc721: Option<Address>,
    pub generic: Option<Address>,
}

impl HandlerSet {
    pub fn get(&self, kind: HandlerKind) -> Option<Address> {
        match kind {
            HandlerKind::Fungible => self.erc20,
            HandlerKind::NonFungible => self.erc721,
            HandlerKind::Generic => self.generic,
        }
    }

    /// Which handler class a resolved handler address belongs to
    pub fn kind_of(&self, address: Address) -> Option<HandlerKind> {
        [
            HandlerKind::Fungible,
            HandlerKind::NonFungible,
            HandlerKind::Generic,
        ]
        .into_iter()
        .find(|kind| self.get(*kind) == Some(address))
    }

    pub fn addresses(&self) -> Vec<Address> {
        [self.erc20, self.erc721, self.generic]
            .into_iter()
            .flatten()
            .collect()
    }
}

/// Key of the bridge's `_hasVotedOnProposal` mapping
pub fn nonce_and_id(nonce: DepositNonce, source: ChainId) -> Uint<72, 2> {
    (Uint::<72, 2>::from(nonce.0) << 8) | Uint::<72, 2>::from(source.0)
}

#[async_trait]
pub trait Bridge: Send + Sync {
    fn address(&self) -> Address;

    /// Chain id the bridge contract was deployed with
    async fn chain_id(&self) -> Result<ChainId>;

    async fn handler_for_resource(&self, resource_id: ResourceId) -> Result<Address>;

    async fn deposit_record(
        &self,
        kind: HandlerKind,
        handler: Address,
        nonce: DepositNonce,
        destination: ChainId,
    ) -> Result<DepositRecord>;

    async fn proposal_status(
        &self,
        source: ChainId,
        nonce: DepositNonce,
        data_hash: B256,
    ) -> Result<ProposalStatus>;

    async fn has_voted(
        &self,
        source: ChainId,
        nonce: DepositNonce,
        data_hash: B256,
        relayer: Address,
    ) -> Result<bool>;

    /// Submit `voteProposal`; returns the transaction hash
    async fn vote_proposal(
        &self,
        source: ChainId,
        nonce: DepositNonce,
        resource_id: ResourceId,
        data_hash: B256,
        opts: &TransactOpts,
    ) -> Result<B256>;

    /// Submit `executeProposal`; returns the transaction hash
    async fn execute_proposal(
        &self,
        source: ChainId,
        nonce: DepositNonce,
        data: Bytes,
        resource_id: ResourceId,
        opts: &TransactOpts,
    ) -> Result<B256>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_and_id_packing() {
        let key = nonce_and_id(DepositNonce(1), ChainId(2));
        assert_eq!(key, Uint::<72, 2>::from(0x0102u64));

        let key = nonce_and_id(DepositNonce(u64::MAX), ChainId(0xff));
        assert_eq!(key, Uint::<72, 2>::MAX);
    }

    #[test]
    fn test_handler_set_lookup() {
        let erc20 = Address::repeat_byte(0x20);
        let generic = Address::repeat_byte(0x99);
        let handlers = HandlerSet {
            erc20: Some(erc20),
            erc721: None,
            generic: Some(generic),
        };

        assert_eq!(handlers.kind_of(erc20), Some(HandlerKind::Fungible));
        assert_eq!(handlers.kind_of(generic), Some(HandlerKind::Generic));
        assert_eq!(handlers.kind_of(Address::repeat_byte(0x01)), None);
        assert_eq!(handlers.get(HandlerKind::NonFungible), None);
        assert_eq!(handlers.addresses(), vec![erc20, generic]);
    }

    #[test]
    fn test_deposit_record_into_kind() {
        let record = DepositRecord::Fungible {
            amount: U256::from(5u64),
            recipient: Bytes::from(vec![1, 2]),
        };
        assert_eq!(
            record.into_kind(),
            MessageKind::FungibleTransfer {
                amount: U256::from(5u64),
                recipient: Bytes::from(vec![1, 2]),
            }
        );
    }
}
