//! Bridge bindings over the alloy signer provider

use alloy::{
    network::TransactionBuilder,
    primitives::{Address, Bytes, B256},
    providers::Provider,
    rpc::types::TransactionRequest,
};
use async_trait::async_trait;
use tracing::{debug, info};

use super::contracts::{Bridge as BridgeContract, ERC20Handler, ERC721Handler, GenericHandler};
use super::{nonce_and_id, Bridge, DepositRecord};
use crate::connection::evm::{rpc_err, SignerProvider};
use crate::connection::TransactOpts;
use crate::error::{ChainError, Result};
use crate::proposal::ProposalStatus;
use crate::types::{ChainId, DepositNonce, HandlerKind, ResourceId};

pub struct EvmBridge {
    bridge_address: Address,
    provider: SignerProvider,
}

impl EvmBridge {
    pub fn new(bridge_address: Address, provider: SignerProvider) -> Self {
        Self {
            bridge_address,
            provider,
        }
    }

    fn with_opts(tx: TransactionRequest, opts: &TransactOpts) -> TransactionRequest {
        tx.with_from(opts.from)
            .with_nonce(opts.nonce)
            .with_gas_price(opts.gas_price)
            .with_gas_limit(opts.gas_limit)
            .with_chain_id(opts.chain_id)
    }

    async fn submit(&self, tx: TransactionRequest) -> Result<B256> {
        let pending = self
            .provider
            .send_transaction(tx)
            .await
            .map_err(|e| ChainError::Submission(e.to_string()))?;
        Ok(*pending.tx_hash())
    }
}

#[async_trait]
impl Bridge for EvmBridge {
    fn address(&self) -> Address {
        self.bridge_address
    }

    async fn chain_id(&self) -> Result<ChainId> {
        let contract = BridgeContract::new(self.bridge_address, &self.provider);
        let result = contract._chainID().call().await.map_err(rpc_err)?;
        Ok(ChainId(result._0))
    }

    async fn handler_for_resource(&self, resource_id: ResourceId) -> Result<Address> {
        let contract = BridgeContract::new(self.bridge_address, &self.provider);
        let result = contract
            ._resourceIDToHandlerAddress(resource_id)
            .call()
            .await
            .map_err(rpc_err)?;
        Ok(result._0)
    }

    async fn deposit_record(
        &self,
        kind: HandlerKind,
        handler: Address,
        nonce: DepositNonce,
        destination: ChainId,
    ) -> Result<DepositRecord> {
        debug!(%handler, %kind, %nonce, %destination, "Fetching deposit record");
        let record = match kind {
            HandlerKind::Fungible => {
                let contract = ERC20Handler::new(handler, &self.provider);
                let r = contract
                    .getDepositRecord(nonce.0, destination.0)
                    .call()
                    .await
                    .map_err(rpc_err)?
                    ._0;
                DepositRecord::Fungible {
                    amount: r._amount,
                    recipient: r._destinationRecipientAddress,
                }
            }
            HandlerKind::NonFungible => {
                let contract = ERC721Handler::new(handler, &self.provider);
                let r = contract
                    .getDepositRecord(nonce.0, destination.0)
                    .call()
                    .await
                    .map_err(rpc_err)?
                    ._0;
                DepositRecord::NonFungible {
                    token_id: r._tokenID,
                    recipient: r._destinationRecipientAddress,
                    metadata: r._metaData,
                }
            }
            HandlerKind::Generic => {
                let contract = GenericHandler::new(handler, &self.provider);
                let r = contract
                    .getDepositRecord(nonce.0, destination.0)
                    .call()
                    .await
                    .map_err(rpc_err)?
                    ._0;
                DepositRecord::Generic {
                    metadata: r._metaData,
                }
            }
        };
        Ok(record)
    }

    async fn proposal_status(
        &self,
        source: ChainId,
        nonce: DepositNonce,
        data_hash: B256,
    ) -> Result<ProposalStatus> {
        let contract = BridgeContract::new(self.bridge_address, &self.provider);
        let proposal = contract
            .getProposal(source.0, nonce.0, data_hash)
            .call()
            .await
            .map_err(rpc_err)?
            ._0;
        ProposalStatus::try_from(proposal._status)
    }

    async fn has_voted(
        &self,
        source: ChainId,
        nonce: DepositNonce,
        data_hash: B256,
        relayer: Address,
    ) -> Result<bool> {
        let contract = BridgeContract::new(self.bridge_address, &self.provider);
        let result = contract
            ._hasVotedOnProposal(nonce_and_id(nonce, source), data_hash, relayer)
            .call()
            .await
            .map_err(rpc_err)?;
        Ok(result._0)
    }

    async fn vote_proposal(
        &self,
        source: ChainId,
        nonce: DepositNonce,
        resource_id: ResourceId,
        data_hash: B256,
        opts: &TransactOpts,
    ) -> Result<B256> {
        let contract = BridgeContract::new(self.bridge_address, &self.provider);
        let tx = contract
            .voteProposal(source.0, nonce.0, resource_id, data_hash)
            .into_transaction_request();

        let tx_hash = self.submit(Self::with_opts(tx, opts)).await?;
        info!(
            %source,
            %nonce,
            %tx_hash,
            tx_nonce = opts.nonce,
            gas_price = opts.gas_price,
            "Submitted voteProposal"
        );
        Ok(tx_hash)
    }

    async fn execute_proposal(
        &self,
        source: ChainId,
        nonce: DepositNonce,
        data: Bytes,
        resource_id: ResourceId,
        opts: &TransactOpts,
    ) -> Result<B256> {
        let contract = BridgeContract::new(self.bridge_address, &self.provider);
        let tx = contract
            .executeProposal(source.0, nonce.0, data, resource_id)
            .into_transaction_request();

        let tx_hash = self.submit(Self::with_opts(tx, opts)).await?;
        info!(
            %source,
            %nonce,
            %tx_hash,
            tx_nonce = opts.nonce,
            gas_price = opts.gas_price,
            "Submitted executeProposal"
        );
        Ok(tx_hash)
    }
}
