use std::sync::Arc;

use alloy::primitives::{Address, TxKind, U256};
use alloy::rpc::types::{BlockId, Filter, TransactionInput, TransactionRequest};
use alloy::sol_types::SolCall;
use async_trait::async_trait;

use crate::cache::RawLog;
use crate::rpc::client::{RpcClient, RpcError};
use crate::types::erc::{IErc721, IErc1155, tracked_topics};
use crate::types::token::TokenKind;

/// Best-effort contract identity. Any field a contract does not expose, or
/// whose call fails, stays `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContractProfile {
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub owner: Option<Address>,
}

/// Everything the pipeline wants from a chain. Plugins and the collectors
/// hold this as `Arc<dyn ChainReader>` so tests can substitute stubs.
#[async_trait]
pub trait ChainReader: Send + Sync + 'static {
    async fn head_block(&self) -> Result<u64, RpcError>;

    /// Fetch the tracked transfer/URI events for a block range, optionally
    /// restricted to the given contracts.
    async fn logs(
        &self,
        from_block: u64,
        to_block: u64,
        contracts: &[Address],
    ) -> Result<Vec<RawLog>, RpcError>;

    /// `balanceOf(holder, id)` evaluated at the given block.
    async fn balance_of(
        &self,
        contract: Address,
        holder: Address,
        id: U256,
        block_number: u64,
    ) -> Result<U256, RpcError>;

    /// `tokenURI(id)` or `uri(id)` depending on the standard.
    async fn token_uri(
        &self,
        contract: Address,
        id: U256,
        kind: TokenKind,
    ) -> Result<String, RpcError>;

    async fn contract_profile(&self, contract: Address) -> ContractProfile;
}

pub struct OnChainReader {
    client: Arc<RpcClient>,
}

impl OnChainReader {
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self { client }
    }

    fn view_request(contract: Address, calldata: Vec<u8>) -> TransactionRequest {
        TransactionRequest {
            to: Some(TxKind::Call(contract)),
            input: TransactionInput::new(calldata.into()),
            ..Default::default()
        }
    }

    async fn view_call(
        &self,
        contract: Address,
        calldata: Vec<u8>,
        block: Option<BlockId>,
    ) -> Result<alloy::primitives::Bytes, RpcError> {
        let request = Self::view_request(contract, calldata);
        self.client.call(&request, block).await
    }
}

#[async_trait]
impl ChainReader for OnChainReader {
    async fn head_block(&self) -> Result<u64, RpcError> {
        self.client.get_block_number().await
    }

    async fn logs(
        &self,
        from_block: u64,
        to_block: u64,
        contracts: &[Address],
    ) -> Result<Vec<RawLog>, RpcError> {
        let mut filter = Filter::new()
            .from_block(from_block)
            .to_block(to_block)
            .event_signature(tracked_topics().to_vec());
        if !contracts.is_empty() {
            filter = filter.address(contracts.to_vec());
        }

        let logs = self.client.get_logs(&filter).await?;
        // Pending logs without a block position cannot be ordered; skip them.
        Ok(logs.iter().filter_map(RawLog::from_rpc).collect())
    }

    async fn balance_of(
        &self,
        contract: Address,
        holder: Address,
        id: U256,
        block_number: u64,
    ) -> Result<U256, RpcError> {
        let calldata = IErc1155::balanceOfCall { account: holder, id }.abi_encode();
        let output = self
            .view_call(contract, calldata, Some(BlockId::number(block_number)))
            .await?;
        IErc1155::balanceOfCall::abi_decode_returns(&output)
            .map_err(|e| RpcError::ProviderError(format!("balanceOf decode failed: {e}")))
    }

    async fn token_uri(
        &self,
        contract: Address,
        id: U256,
        kind: TokenKind,
    ) -> Result<String, RpcError> {
        let output = match kind {
            TokenKind::Erc721 => {
                let calldata = IErc721::tokenURICall { tokenId: id }.abi_encode();
                let raw = self.view_call(contract, calldata, None).await?;
                IErc721::tokenURICall::abi_decode_returns(&raw)
                    .map_err(|e| RpcError::ProviderError(format!("tokenURI decode failed: {e}")))?
            }
            TokenKind::Erc1155 => {
                let calldata = IErc1155::uriCall { id }.abi_encode();
                let raw = self.view_call(contract, calldata, None).await?;
                IErc1155::uriCall::abi_decode_returns(&raw)
                    .map_err(|e| RpcError::ProviderError(format!("uri decode failed: {e}")))?
            }
        };
        Ok(output)
    }

    async fn contract_profile(&self, contract: Address) -> ContractProfile {
        let name = match self
            .view_call(contract, IErc721::nameCall {}.abi_encode(), None)
            .await
            .map(|raw| IErc721::nameCall::abi_decode_returns(&raw))
        {
            Ok(Ok(name)) => Some(name),
            Ok(Err(e)) => {
                tracing::debug!("name() decode failed for {contract}: {e}");
                None
            }
            Err(e) => {
                tracing::debug!("name() call failed for {contract}: {e}");
                None
            }
        };

        let symbol = match self
            .view_call(contract, IErc721::symbolCall {}.abi_encode(), None)
            .await
            .map(|raw| IErc721::symbolCall::abi_decode_returns(&raw))
        {
            Ok(Ok(symbol)) => Some(symbol),
            Ok(Err(e)) => {
                tracing::debug!("symbol() decode failed for {contract}: {e}");
                None
            }
            Err(e) => {
                tracing::debug!("symbol() call failed for {contract}: {e}");
                None
            }
        };

        let owner = match self
            .view_call(contract, IErc721::ownerCall {}.abi_encode(), None)
            .await
            .map(|raw| IErc721::ownerCall::abi_decode_returns(&raw))
        {
            Ok(Ok(owner)) => Some(owner),
            Ok(Err(e)) => {
                tracing::debug!("owner() decode failed for {contract}: {e}");
                None
            }
            Err(e) => {
                tracing::debug!("owner() call failed for {contract}: {e}");
                None
            }
        };

        ContractProfile { name, symbol, owner }
    }
}
