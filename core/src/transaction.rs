use alloy::primitives::{Address, B256, Bytes, TxKind, U256};
use alloy::rpc::types::TransactionRequest as RpcTransactionRequest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Nonce stamped on a record that was cancelled before it was ever sent.
pub const CANCELLED_WHILE_QUEUED_NONCE: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Queued,
    Sent,
    Mined,
    Errored,
    Cancelled,
}

impl TransactionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransactionStatus::Mined | TransactionStatus::Errored | TransactionStatus::Cancelled
        )
    }

    /// Whether a record in `self` may be written with status `next`.
    ///
    /// `queued -> sent -> {mined, errored, cancelled}` and `queued -> cancelled`. A non-terminal
    /// record may also be rewritten in place (a resend keeps `sent`, an exhausted first send keeps
    /// `queued`). Terminal records never change.
    pub fn can_transition_to(self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        match (self, next) {
            (Queued, Queued | Sent | Cancelled) => true,
            (Sent, Sent | Mined | Errored | Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransactionStatus::Queued => "queued",
            TransactionStatus::Sent => "sent",
            TransactionStatus::Mined => "mined",
            TransactionStatus::Errored => "errored",
            TransactionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnchainStatus {
    Success,
    Reverted,
}

impl From<bool> for OnchainStatus {
    fn from(success: bool) -> Self {
        if success {
            OnchainStatus::Success
        } else {
            OnchainStatus::Reverted
        }
    }
}

/// A pre-signed user operation, relayed to the bundler as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationRequest {
    pub entrypoint: Address,
    pub user_operation: serde_json::Value,
}

/// Fees and gas limit used for a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasParams {
    pub gas_limit: u64,
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

/// What a caller submits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitTransactionRequest {
    pub chain_id: u64,
    pub from: Address,
    /// `None` deploys a contract.
    #[serde(default)]
    pub to: Option<Address>,
    #[serde(default)]
    pub data: Bytes,
    #[serde(default)]
    pub value: U256,
    #[serde(default)]
    pub gas: Option<u64>,
    #[serde(default)]
    pub max_fee_per_gas: Option<u128>,
    #[serde(default)]
    pub max_priority_fee_per_gas: Option<u128>,
    #[serde(default)]
    pub user_operation: Option<UserOperationRequest>,
    /// Used as the queue id when present, making resubmission idempotent.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub queue_id: String,
    /// Bumped on every successful store update.
    #[serde(default)]
    pub version: u64,
    pub status: TransactionStatus,

    pub chain_id: u64,
    pub from: Address,
    pub is_user_op: bool,

    pub to: Option<Address>,
    pub data: Bytes,
    pub value: U256,
    pub gas: Option<u64>,
    pub max_fee_per_gas: Option<u128>,
    pub max_priority_fee_per_gas: Option<u128>,
    pub user_operation: Option<UserOperationRequest>,

    pub queued_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub mined_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,

    pub nonce: Option<i64>,
    #[serde(default)]
    pub sent_transaction_hashes: Vec<B256>,
    pub sent_at_block: Option<u64>,
    #[serde(default)]
    pub resend_count: u32,
    /// Gas parameters of the latest broadcast; the floor for the next replacement.
    pub sent_gas: Option<GasParams>,

    pub user_op_hash: Option<B256>,
    pub sender: Option<Address>,
    pub user_op_nonce: Option<String>,

    pub transaction_hash: Option<B256>,
    pub mined_at_block: Option<u64>,
    pub onchain_status: Option<OnchainStatus>,
    pub gas_used: Option<u64>,
    pub effective_gas_price: Option<u128>,
    pub cumulative_gas_used: Option<u64>,
    pub transaction_type: Option<u8>,

    pub error_message: Option<String>,
}

impl TransactionRecord {
    pub fn queued(queue_id: String, request: SubmitTransactionRequest, now: DateTime<Utc>) -> Self {
        Self {
            queue_id,
            version: 0,
            status: TransactionStatus::Queued,
            chain_id: request.chain_id,
            from: request.from,
            is_user_op: request.user_operation.is_some(),
            to: request.to,
            data: request.data,
            value: request.value,
            gas: request.gas,
            max_fee_per_gas: request.max_fee_per_gas,
            max_priority_fee_per_gas: request.max_priority_fee_per_gas,
            user_operation: request.user_operation,
            queued_at: now,
            sent_at: None,
            mined_at: None,
            cancelled_at: None,
            nonce: None,
            sent_transaction_hashes: Vec::new(),
            sent_at_block: None,
            resend_count: 0,
            sent_gas: None,
            user_op_hash: None,
            sender: None,
            user_op_nonce: None,
            transaction_hash: None,
            mined_at_block: None,
            onchain_status: None,
            gas_used: None,
            effective_gas_price: None,
            cumulative_gas_used: None,
            transaction_type: None,
            error_message: None,
        }
    }

    /// The ledger nonce this record occupies, if any.
    pub fn assigned_nonce(&self) -> Option<u64> {
        self.nonce.and_then(|n| u64::try_from(n).ok())
    }

    pub fn last_sent_hash(&self) -> Option<B256> {
        self.sent_transaction_hashes.last().copied()
    }

    pub fn ms_since_queued(&self, now: DateTime<Utc>) -> i64 {
        (now - self.queued_at).num_milliseconds()
    }

    pub fn ms_since_sent(&self, now: DateTime<Utc>) -> Option<i64> {
        self.sent_at.map(|sent| (now - sent).num_milliseconds())
    }

    /// Unsigned EIP-1559 request for this record's call. Nonce and fees are left for the caller.
    pub fn to_rpc_request(&self) -> RpcTransactionRequest {
        RpcTransactionRequest {
            from: Some(self.from),
            to: Some(self.to.map(TxKind::Call).unwrap_or(TxKind::Create)),
            value: Some(self.value),
            input: self.data.clone().into(),
            chain_id: Some(self.chain_id),
            ..Default::default()
        }
    }
}
