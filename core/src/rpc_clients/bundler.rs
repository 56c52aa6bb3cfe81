use alloy::primitives::{Address, B256};
use alloy::rpc::client::RpcClient;
use alloy::rpc::types::UserOperationReceipt;
use alloy::transports::TransportResult;
use alloy::transports::http::reqwest::Url;

/// JSON-RPC client for an ERC-4337 bundler.
#[derive(Debug, Clone)]
pub struct BundlerClient {
    inner: RpcClient,
    url: Url,
}

impl BundlerClient {
    pub fn new_http(url: Url) -> Self {
        Self {
            inner: RpcClient::new_http(url.clone()),
            url,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// `None` until the bundler has seen the user operation included.
    pub async fn get_user_op_receipt(
        &self,
        user_op_hash: B256,
    ) -> TransportResult<Option<UserOperationReceipt>> {
        self.inner
            .request("eth_getUserOperationReceipt", (user_op_hash,))
            .await
    }

    pub async fn send_user_op(
        &self,
        user_op: &serde_json::Value,
        entrypoint: Address,
    ) -> TransportResult<B256> {
        self.inner
            .request("eth_sendUserOperation", (user_op, entrypoint))
            .await
    }
}
