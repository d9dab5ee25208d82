//! Bridge and handler contract ABI definitions
//!
//! Uses alloy's sol! macro to generate type-safe bindings for the bridge
//! contract and the three handler contracts it dispatches to.

#![allow(clippy::too_many_arguments)]

use alloy::sol;

sol! {
    /// Bridge contract: proposal voting and execution
    #[sol(rpc)]
    contract Bridge {
        struct Proposal {
            bytes32 _resourceID;
            bytes32 _dataHash;
            address[] _yesVotes;
            address[] _noVotes;
            uint8 _status;
            uint256 _proposedBlock;
        }

        function _chainID() external view returns (uint8);

        function _resourceIDToHandlerAddress(bytes32 resourceID) external view returns (address);

        /// Keyed by `(depositNonce << 8) | originChainID`
        function _hasVotedOnProposal(uint72 nonceAndID, bytes32 dataHash, address relayer)
            external view returns (bool);

        function getProposal(uint8 originChainID, uint64 depositNonce, bytes32 dataHash)
            external view returns (Proposal memory);

        function voteProposal(uint8 chainID, uint64 depositNonce, bytes32 resourceID, bytes32 dataHash)
            external;

        function executeProposal(uint8 chainID, uint64 depositNonce, bytes data, bytes32 resourceID)
            external;

        event Deposit(
            uint8 indexed destinationChainID,
            bytes32 indexed resourceID,
            uint64 indexed depositNonce
        );

        event ProposalEvent(
            uint8 indexed originChainID,
            uint64 indexed depositNonce,
            uint8 indexed status,
            bytes32 resourceID,
            bytes32 dataHash
        );

        event ProposalVote(
            uint8 indexed originChainID,
            uint64 indexed depositNonce,
            uint8 indexed status,
            bytes32 resourceID
        );
    }
}

sol! {
    #[sol(rpc)]
    contract ERC20Handler {
        struct DepositRecord {
            address _tokenAddress;
            uint8 _lenDestinationRecipientAddress;
            uint8 _destinationChainID;
            bytes32 _resourceID;
            bytes _destinationRecipientAddress;
            address _depositer;
            uint256 _amount;
        }

        function getDepositRecord(uint64 depositNonce, uint8 destId)
            external view returns (DepositRecord memory);
    }
}

sol! {
    #[sol(rpc)]
    contract ERC721Handler {
        struct DepositRecord {
            address _tokenAddress;
            uint8 _destinationChainID;
            bytes32 _resourceID;
            bytes _destinationRecipientAddress;
            address _depositer;
            uint256 _tokenID;
            bytes _metaData;
        }

        function getDepositRecord(uint64 depositNonce, uint8 destId)
            external view returns (DepositRecord memory);
    }
}

sol! {
    #[sol(rpc)]
    contract GenericHandler {
        struct DepositRecord {
            uint8 _destinationChainID;
            address _depositer;
            bytes32 _resourceID;
            bytes _metaData;
        }

        function getDepositRecord(uint64 depositNonce, uint8 destId)
            external view returns (DepositRecord memory);
    }
}
