//! Hash computation for event topics and proposal data
//!
//! The bridge identifies a proposal by `keccak256(handler ++ data)`, so the
//! writer must reproduce that hash bit-for-bit before querying proposal state.

use alloy::primitives::{Address, B256};
use tiny_keccak::{Hasher, Keccak};

/// Compute keccak256 hash of data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// Compute the proposal data hash the bridge records for a vote:
/// keccak256(abi.encodePacked(handlerAddress, data))
pub fn proposal_data_hash(handler: Address, data: &[u8]) -> B256 {
    let mut packed = Vec::with_capacity(20 + data.len());
    packed.extend_from_slice(handler.as_slice());
    packed.extend_from_slice(data);
    B256::from(keccak256(&packed))
}

/// Key for caching proposal data between the vote and the execution of a
/// proposal: keccak256(source ++ nonce ++ dataHash)
pub fn proposal_key(source: u8, nonce: u64, data_hash: &B256) -> [u8; 32] {
    let mut buf = [0u8; 1 + 8 + 32];
    buf[0] = source;
    buf[1..9].copy_from_slice(&nonce.to_be_bytes());
    buf[9..].copy_from_slice(data_hash.as_slice());
    keccak256(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keccak256_empty() {
        let hash = keccak256(&[]);
        assert_eq!(
            hex::encode(hash),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_keccak256_matches_alloy() {
        let data = b"Deposit(uint8,bytes32,uint64)";
        assert_eq!(
            B256::from(keccak256(data)),
            alloy::primitives::keccak256(data)
        );
    }

    #[test]
    fn test_proposal_data_hash_includes_handler() {
        let data = [1u8, 2, 3];
        let a = proposal_data_hash(Address::repeat_byte(0x11), &data);
        let b = proposal_data_hash(Address::repeat_byte(0x22), &data);
        assert_ne!(a, b);

        let mut packed = vec![0x11u8; 20];
        packed.extend_from_slice(&data);
        assert_eq!(a, B256::from(keccak256(&packed)));
    }

    #[test]
    fn test_proposal_key_distinguishes_sources() {
        let hash = B256::repeat_byte(0x42);
        assert_ne!(proposal_key(1, 5, &hash), proposal_key(2, 5, &hash));
        assert_ne!(proposal_key(1, 5, &hash), proposal_key(1, 6, &hash));
        assert_eq!(proposal_key(1, 5, &hash), proposal_key(1, 5, &hash));
    }
}
