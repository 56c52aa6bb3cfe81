use alloy::{
    network::{ReceiptResponse, TransactionResponse},
    primitives::{Address, B256},
    providers::{Provider, ProviderBuilder, RootProvider},
    rpc::types::TransactionRequest as RpcTransactionRequest,
    transports::http::reqwest::Url,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    error::{AlloyRpcErrorToEngineError, EngineError},
    rpc_clients::BundlerClient,
    transaction::OnchainStatus,
};

/// Network fee suggestion for an EIP-1559 transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkFees {
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

/// The parts of a transaction receipt the pipeline records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptSummary {
    pub transaction_hash: B256,
    pub block_number: u64,
    pub status: OnchainStatus,
    pub gas_used: u64,
    pub effective_gas_price: u128,
    pub cumulative_gas_used: u64,
    pub transaction_type: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionSummary {
    pub hash: B256,
    pub block_number: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserOpReceiptSummary {
    pub success: bool,
    pub sender: Address,
    pub nonce: String,
    /// Hash of the bundle transaction that included the user operation.
    pub transaction_hash: B256,
}

/// Everything the pipeline asks of one chain's node and bundler.
#[async_trait]
pub trait Chain: Send + Sync {
    fn chain_id(&self) -> u64;

    async fn block_number(&self) -> Result<u64, EngineError>;

    /// Transaction count at the pending block, i.e. the next nonce the node expects.
    async fn pending_transaction_count(&self, address: Address) -> Result<u64, EngineError>;

    async fn estimate_fees(&self) -> Result<NetworkFees, EngineError>;

    async fn estimate_gas(&self, request: &RpcTransactionRequest) -> Result<u64, EngineError>;

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<B256, EngineError>;

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<ReceiptSummary>, EngineError>;

    async fn transaction_by_hash(
        &self,
        hash: B256,
    ) -> Result<Option<TransactionSummary>, EngineError>;

    async fn send_user_operation(
        &self,
        user_op: &serde_json::Value,
        entrypoint: Address,
    ) -> Result<B256, EngineError>;

    async fn user_operation_receipt(
        &self,
        user_op_hash: B256,
    ) -> Result<Option<UserOpReceiptSummary>, EngineError>;
}

pub trait ChainService: Send + Sync {
    fn get_chain(&self, chain_id: u64) -> Result<impl Chain, EngineError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub rpc_url: String,
    #[serde(default)]
    pub bundler_url: Option<String>,
}

impl ChainConfig {
    pub fn to_chain(&self) -> Result<RpcChain, EngineError> {
        let parse = |kind: &str, url: &str| {
            Url::parse(url).map_err(|e| EngineError::RpcConfigError {
                message: format!("Failed to parse {kind} URL for chain {}: {e}", self.chain_id),
            })
        };

        let rpc_url = parse("RPC", &self.rpc_url)?;
        let bundler = self
            .bundler_url
            .as_deref()
            .map(|url| parse("Bundler", url).map(BundlerClient::new_http))
            .transpose()?;

        Ok(RpcChain {
            chain_id: self.chain_id,
            provider: ProviderBuilder::new()
                .disable_recommended_fillers()
                .connect_http(rpc_url.clone()),
            rpc_url,
            bundler,
        })
    }
}

/// A chain reached over HTTP JSON-RPC.
#[derive(Clone, Debug)]
pub struct RpcChain {
    chain_id: u64,
    rpc_url: Url,
    provider: RootProvider,
    bundler: Option<BundlerClient>,
}

impl RpcChain {
    pub fn provider(&self) -> &RootProvider {
        &self.provider
    }

    fn rpc_error(&self, err: alloy::transports::TransportError) -> EngineError {
        err.to_engine_error(self.chain_id, self.rpc_url.as_str())
    }

    fn bundler(&self) -> Result<&BundlerClient, EngineError> {
        self.bundler.as_ref().ok_or_else(|| EngineError::RpcConfigError {
            message: format!("No bundler configured for chain {}", self.chain_id),
        })
    }
}

#[async_trait]
impl Chain for RpcChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn block_number(&self) -> Result<u64, EngineError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| self.rpc_error(e))
    }

    async fn pending_transaction_count(&self, address: Address) -> Result<u64, EngineError> {
        self.provider
            .get_transaction_count(address)
            .pending()
            .await
            .map_err(|e| self.rpc_error(e))
    }

    async fn estimate_fees(&self) -> Result<NetworkFees, EngineError> {
        let estimate = self
            .provider
            .estimate_eip1559_fees()
            .await
            .map_err(|e| self.rpc_error(e))?;

        Ok(NetworkFees {
            max_fee_per_gas: estimate.max_fee_per_gas,
            max_priority_fee_per_gas: estimate.max_priority_fee_per_gas,
        })
    }

    async fn estimate_gas(&self, request: &RpcTransactionRequest) -> Result<u64, EngineError> {
        self.provider
            .estimate_gas(request.clone())
            .await
            .map_err(|e| self.rpc_error(e))
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<B256, EngineError> {
        let pending = self
            .provider
            .send_raw_transaction(raw)
            .await
            .map_err(|e| self.rpc_error(e))?;
        Ok(*pending.tx_hash())
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<ReceiptSummary>, EngineError> {
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| self.rpc_error(e))?;

        let Some(receipt) = receipt else {
            return Ok(None);
        };
        // A receipt without a block is still pending on some nodes.
        let Some(block_number) = receipt.block_number() else {
            return Ok(None);
        };

        Ok(Some(ReceiptSummary {
            transaction_hash: receipt.transaction_hash(),
            block_number,
            status: receipt.status().into(),
            gas_used: receipt.gas_used(),
            effective_gas_price: receipt.effective_gas_price(),
            cumulative_gas_used: receipt.cumulative_gas_used(),
            transaction_type: receipt.inner.tx_type() as u8,
        }))
    }

    async fn transaction_by_hash(
        &self,
        hash: B256,
    ) -> Result<Option<TransactionSummary>, EngineError> {
        let tx = self
            .provider
            .get_transaction_by_hash(hash)
            .await
            .map_err(|e| self.rpc_error(e))?;

        Ok(tx.map(|tx| TransactionSummary {
            hash: tx.tx_hash(),
            block_number: tx.block_number(),
        }))
    }

    async fn send_user_operation(
        &self,
        user_op: &serde_json::Value,
        entrypoint: Address,
    ) -> Result<B256, EngineError> {
        let bundler = self.bundler()?;
        bundler
            .send_user_op(user_op, entrypoint)
            .await
            .map_err(|e| e.to_engine_bundler_error(self.chain_id, bundler.url().as_str()))
    }

    async fn user_operation_receipt(
        &self,
        user_op_hash: B256,
    ) -> Result<Option<UserOpReceiptSummary>, EngineError> {
        let bundler = self.bundler()?;
        let receipt = bundler
            .get_user_op_receipt(user_op_hash)
            .await
            .map_err(|e| e.to_engine_bundler_error(self.chain_id, bundler.url().as_str()))?;

        Ok(receipt.map(|r| UserOpReceiptSummary {
            success: r.success,
            sender: r.sender,
            nonce: r.nonce.to_string(),
            transaction_hash: r.receipt.transaction_hash,
        }))
    }
}
