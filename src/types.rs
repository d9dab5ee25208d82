//! Common types shared by the listener, writer and router
//!
//! A [`Message`] is the unit the router moves between chains: it is produced by
//! the listener of the source chain and consumed by the writer of the
//! destination chain.

use alloy::primitives::{Bytes, B256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Resource identifier registered on the bridge (maps to a handler contract)
pub type ResourceId = B256;

/// Bridge-assigned chain identifier (a `uint8` on chain)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(pub u8);

impl ChainId {
    pub fn as_u8(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u8> for ChainId {
    fn from(id: u8) -> Self {
        ChainId(id)
    }
}

/// Per-(source, destination) deposit counter assigned by the source bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DepositNonce(pub u64);

impl fmt::Display for DepositNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for DepositNonce {
    fn from(n: u64) -> Self {
        DepositNonce(n)
    }
}

/// Asset class a handler contract is responsible for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Fungible,
    NonFungible,
    Generic,
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerKind::Fungible => write!(f, "erc20"),
            HandlerKind::NonFungible => write!(f, "erc721"),
            HandlerKind::Generic => write!(f, "generic"),
        }
    }
}

/// Payload carried by a [`Message`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    /// ERC20 deposit: vote to release `amount` to `recipient`
    FungibleTransfer { amount: U256, recipient: Bytes },
    /// ERC721 deposit
    NonFungibleTransfer {
        token_id: U256,
        recipient: Bytes,
        metadata: Bytes,
    },
    /// Arbitrary call data deposit
    GenericTransfer { metadata: Bytes },
    /// A proposal on this chain reached Passed and can now be executed
    ProposalPassed { data_hash: B256 },
}

impl MessageKind {
    /// Short label used in logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::FungibleTransfer { .. } => "fungible",
            MessageKind::NonFungibleTransfer { .. } => "nonfungible",
            MessageKind::GenericTransfer { .. } => "generic",
            MessageKind::ProposalPassed { .. } => "proposal_passed",
        }
    }

    /// Handler class whose contract processes this payload, if it is a transfer
    pub fn handler_kind(&self) -> Option<HandlerKind> {
        match self {
            MessageKind::FungibleTransfer { .. } => Some(HandlerKind::Fungible),
            MessageKind::NonFungibleTransfer { .. } => Some(HandlerKind::NonFungible),
            MessageKind::GenericTransfer { .. } => Some(HandlerKind::Generic),
            MessageKind::ProposalPassed { .. } => None,
        }
    }

    /// Proposal data as stored by the bridge for this transfer.
    ///
    /// Dynamic fields are length-prefixed with a 32-byte big-endian word.
    pub fn proposal_data(&self) -> Option<Bytes> {
        let mut data = Vec::new();
        match self {
            MessageKind::FungibleTransfer { amount, recipient } => {
                data.extend_from_slice(&amount.to_be_bytes::<32>());
                push_length_prefixed(&mut data, recipient);
            }
            MessageKind::NonFungibleTransfer {
                token_id,
                recipient,
                metadata,
            } => {
                data.extend_from_slice(&token_id.to_be_bytes::<32>());
                push_length_prefixed(&mut data, recipient);
                push_length_prefixed(&mut data, metadata);
            }
            MessageKind::GenericTransfer { metadata } => {
                push_length_prefixed(&mut data, metadata);
            }
            MessageKind::ProposalPassed { .. } => return None,
        }
        Some(data.into())
    }
}

fn push_length_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&U256::from(bytes.len()).to_be_bytes::<32>());
    buf.extend_from_slice(bytes);
}

/// A cross-chain message routed between chain runtimes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub source: ChainId,
    pub destination: ChainId,
    pub deposit_nonce: DepositNonce,
    pub resource_id: ResourceId,
    pub kind: MessageKind,
}

impl Message {
    /// Build the message for a fungible deposit observed on `source`
    pub fn fungible(
        source: ChainId,
        destination: ChainId,
        deposit_nonce: DepositNonce,
        resource_id: ResourceId,
        amount: U256,
        recipient: Bytes,
    ) -> Self {
        Self {
            source,
            destination,
            deposit_nonce,
            resource_id,
            kind: MessageKind::FungibleTransfer { amount, recipient },
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}->{} nonce={}",
            self.kind.name(),
            self.source,
            self.destination,
            self.deposit_nonce
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fungible_proposal_data_layout() {
        let recipient = Bytes::from(vec![0xab; 20]);
        let kind = MessageKind::FungibleTransfer {
            amount: U256::from(1_000u64),
            recipient: recipient.clone(),
        };

        let data = kind.proposal_data().unwrap();
        assert_eq!(data.len(), 32 + 32 + 20);
        assert_eq!(U256::from_be_slice(&data[..32]), U256::from(1_000u64));
        assert_eq!(U256::from_be_slice(&data[32..64]), U256::from(20u64));
        assert_eq!(&data[64..], recipient.as_ref());
    }

    #[test]
    fn test_nonfungible_proposal_data_layout() {
        let kind = MessageKind::NonFungibleTransfer {
            token_id: U256::from(7u64),
            recipient: Bytes::from(vec![0x01; 20]),
            metadata: Bytes::from(vec![0x02; 3]),
        };

        let data = kind.proposal_data().unwrap();
        assert_eq!(data.len(), 32 + 32 + 20 + 32 + 3);
        assert_eq!(U256::from_be_slice(&data[..32]), U256::from(7u64));
        assert_eq!(U256::from_be_slice(&data[84..116]), U256::from(3u64));
        assert_eq!(&data[116..], &[0x02, 0x02, 0x02]);
    }

    #[test]
    fn test_generic_proposal_data_layout() {
        let kind = MessageKind::GenericTransfer {
            metadata: Bytes::from(vec![0xff; 4]),
        };

        let data = kind.proposal_data().unwrap();
        assert_eq!(data.len(), 36);
        assert_eq!(U256::from_be_slice(&data[..32]), U256::from(4u64));
    }

    #[test]
    fn test_proposal_passed_has_no_data() {
        let kind = MessageKind::ProposalPassed {
            data_hash: B256::ZERO,
        };
        assert!(kind.proposal_data().is_none());
        assert!(kind.handler_kind().is_none());
    }

    #[test]
    fn test_chain_id_display() {
        assert_eq!(ChainId(3).to_string(), "3");
        assert_eq!(ChainId::from(9).as_u8(), 9);
    }
}
