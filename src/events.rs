//! Bridge event signatures and raw log decoding
//!
//! Logs are matched on topic0, the keccak256 hash of the event signature text.
//! The signature strings below are part of the persisted state's meaning: a
//! checkpoint is only valid as long as the same topics are scanned.

use alloy::primitives::B256;
use std::fmt;

use crate::connection::ChainLog;
use crate::error::{ChainError, Result};
use crate::hash::keccak256;
use crate::proposal::ProposalStatus;
use crate::types::{ChainId, DepositNonce, ResourceId};

/// Canonical text of a Solidity event signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventSig(&'static str);

impl EventSig {
    pub const fn new(signature: &'static str) -> Self {
        Self(signature)
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }

    /// topic0 for logs of this event
    pub fn topic(&self) -> B256 {
        B256::from(keccak256(self.0.as_bytes()))
    }
}

impl fmt::Display for EventSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

pub const DEPOSIT: EventSig = EventSig::new("Deposit(uint8,bytes32,uint64)");
pub const PROPOSAL_EVENT: EventSig =
    EventSig::new("ProposalEvent(uint8,uint64,uint8,bytes32,bytes32)");
pub const PROPOSAL_VOTE: EventSig = EventSig::new("ProposalVote(uint8,uint64,uint8,bytes32)");

/// Topics the listener subscribes to
pub fn watched_topics() -> Vec<B256> {
    vec![DEPOSIT.topic(), PROPOSAL_EVENT.topic(), PROPOSAL_VOTE.topic()]
}

/// A decoded bridge log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    Deposit {
        destination: ChainId,
        resource_id: ResourceId,
        deposit_nonce: DepositNonce,
    },
    ProposalEvent {
        origin: ChainId,
        deposit_nonce: DepositNonce,
        status: ProposalStatus,
        resource_id: ResourceId,
        data_hash: B256,
    },
    ProposalVote {
        origin: ChainId,
        deposit_nonce: DepositNonce,
        status: ProposalStatus,
        resource_id: ResourceId,
    },
}

/// Decode a raw log into a bridge event.
///
/// Returns `Ok(None)` for logs whose topic0 is not a bridge event.
pub fn decode_log(log: &ChainLog) -> Result<Option<BridgeEvent>> {
    let Some(topic0) = log.topics.first() else {
        return Ok(None);
    };

    if *topic0 == DEPOSIT.topic() {
        expect_topics(log, 4)?;
        return Ok(Some(BridgeEvent::Deposit {
            destination: ChainId(topic_u8(&log.topics[1])?),
            resource_id: log.topics[2],
            deposit_nonce: DepositNonce(topic_u64(&log.topics[3])?),
        }));
    }

    if *topic0 == PROPOSAL_EVENT.topic() {
        expect_topics(log, 4)?;
        let words = data_words(&log.data, 2)?;
        return Ok(Some(BridgeEvent::ProposalEvent {
            origin: ChainId(topic_u8(&log.topics[1])?),
            deposit_nonce: DepositNonce(topic_u64(&log.topics[2])?),
            status: ProposalStatus::try_from(topic_u8(&log.topics[3])?)?,
            resource_id: words[0],
            data_hash: words[1],
        }));
    }

    if *topic0 == PROPOSAL_VOTE.topic() {
        expect_topics(log, 4)?;
        let words = data_words(&log.data, 1)?;
        return Ok(Some(BridgeEvent::ProposalVote {
            origin: ChainId(topic_u8(&log.topics[1])?),
            deposit_nonce: DepositNonce(topic_u64(&log.topics[2])?),
            status: ProposalStatus::try_from(topic_u8(&log.topics[3])?)?,
            resource_id: words[0],
        }));
    }

    Ok(None)
}

fn expect_topics(log: &ChainLog, count: usize) -> Result<()> {
    if log.topics.len() != count {
        return Err(ChainError::Decode(format!(
            "expected {} topics, got {} (block {}, index {})",
            count,
            log.topics.len(),
            log.block_number,
            log.log_index
        )));
    }
    Ok(())
}

fn topic_u8(topic: &B256) -> Result<u8> {
    if topic[..31].iter().any(|b| *b != 0) {
        return Err(ChainError::Decode(format!("topic {} does not fit uint8", topic)));
    }
    Ok(topic[31])
}

fn topic_u64(topic: &B256) -> Result<u64> {
    if topic[..24].iter().any(|b| *b != 0) {
        return Err(ChainError::Decode(format!("topic {} does not fit uint64", topic)));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&topic[24..]);
    Ok(u64::from_be_bytes(buf))
}

fn data_words(data: &[u8], count: usize) -> Result<Vec<B256>> {
    if data.len() < count * 32 {
        return Err(ChainError::Decode(format!(
            "expected {} data words, got {} bytes",
            count,
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(32)
        .take(count)
        .map(B256::from_slice)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{deposit_log, proposal_event_log, proposal_vote_log};
    use alloy::primitives::Address;

    #[test]
    fn test_topics_are_stable() {
        assert_eq!(
            DEPOSIT.topic(),
            alloy::primitives::keccak256("Deposit(uint8,bytes32,uint64)")
        );
        assert_eq!(DEPOSIT.topic(), DEPOSIT.topic());
        assert_ne!(DEPOSIT.topic(), PROPOSAL_EVENT.topic());
        assert_ne!(PROPOSAL_EVENT.topic(), PROPOSAL_VOTE.topic());
        assert_eq!(watched_topics().len(), 3);
    }

    #[test]
    fn test_decode_deposit() {
        let resource = B256::repeat_byte(0x07);
        let log = deposit_log(Address::ZERO, 80, 0, ChainId(2), resource, 42);

        let event = decode_log(&log).unwrap().unwrap();
        assert_eq!(
            event,
            BridgeEvent::Deposit {
                destination: ChainId(2),
                resource_id: resource,
                deposit_nonce: DepositNonce(42),
            }
        );
    }

    #[test]
    fn test_decode_proposal_event() {
        let resource = B256::repeat_byte(0x01);
        let data_hash = B256::repeat_byte(0x02);
        let log = proposal_event_log(
            Address::ZERO,
            10,
            3,
            ChainId(5),
            9,
            ProposalStatus::Passed,
            resource,
            data_hash,
        );

        match decode_log(&log).unwrap().unwrap() {
            BridgeEvent::ProposalEvent {
                origin,
                deposit_nonce,
                status,
                resource_id,
                data_hash: hash,
            } => {
                assert_eq!(origin, ChainId(5));
                assert_eq!(deposit_nonce, DepositNonce(9));
                assert_eq!(status, ProposalStatus::Passed);
                assert_eq!(resource_id, resource);
                assert_eq!(hash, data_hash);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_unknown_topic_is_ignored() {
        let log = ChainLog {
            address: Address::ZERO,
            topics: vec![B256::repeat_byte(0xee)],
            data: Default::default(),
            block_number: 81,
            log_index: 0,
            tx_hash: None,
        };
        assert_eq!(decode_log(&log).unwrap(), None);
    }

    #[test]
    fn test_truncated_proposal_event_is_decode_error() {
        let mut log = proposal_event_log(
            Address::ZERO,
            10,
            0,
            ChainId(1),
            1,
            ProposalStatus::Active,
            B256::ZERO,
            B256::ZERO,
        );
        log.data = vec![0u8; 40].into();

        assert!(matches!(decode_log(&log), Err(ChainError::Decode(_))));
    }

    #[test]
    fn test_out_of_range_status_is_decode_error() {
        let mut log = proposal_event_log(
            Address::ZERO,
            10,
            0,
            ChainId(1),
            1,
            ProposalStatus::Active,
            B256::ZERO,
            B256::ZERO,
        );
        log.topics[3] = B256::with_last_byte(9);

        assert!(matches!(decode_log(&log), Err(ChainError::Decode(_))));
    }

    #[test]
    fn test_oversized_chain_id_topic_is_decode_error() {
        let mut log = deposit_log(Address::ZERO, 1, 0, ChainId(1), B256::ZERO, 1);
        log.topics[1] = B256::left_padding_from(&300u64.to_be_bytes());

        assert!(matches!(decode_log(&log), Err(ChainError::Decode(_))));
    }

    #[test]
    fn test_decode_proposal_vote() {
        let resource = B256::repeat_byte(0x04);
        let log = proposal_vote_log(
            Address::ZERO,
            12,
            1,
            ChainId(3),
            77,
            ProposalStatus::Active,
            resource,
        );

        assert_eq!(
            decode_log(&log).unwrap(),
            Some(BridgeEvent::ProposalVote {
                origin: ChainId(3),
                deposit_nonce: DepositNonce(77),
                status: ProposalStatus::Active,
                resource_id: resource,
            })
        );
    }
}
