//! In-memory stand-ins for every pipeline collaborator, for exercising the stages without
//! Redis or a node.

use std::{
    collections::{BTreeSet, HashMap, HashSet, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use alloy::{
    consensus::TypedTransaction,
    primitives::{Address, B256, Bytes, keccak256},
    rpc::types::TransactionRequest as RpcTransactionRequest,
};
use async_trait::async_trait;
use chrono::Utc;
use relay_core::{
    chain::{
        Chain, ChainService, NetworkFees, ReceiptSummary, TransactionSummary,
        UserOpReceiptSummary,
    },
    error::{EngineError, RpcErrorKind, RpcErrorResponse},
    signer::{SignedTransaction, TransactionSigner},
    transaction::{SubmitTransactionRequest, TransactionRecord},
};
use relay_queue::job::{BorrowedJob, Job};

use crate::{
    RelayServices,
    cancel::CancellationFlow,
    config::{RelayConfig, StaticRelayConfigProvider},
    jobs::{JobProducer, MineJobData, SendJobData, send_job_id},
    mine::MineHandler,
    nonce_ledger::{NonceLedger, NonceLedgerError, NonceSnapshot},
    send::SendHandler,
    store::{StoreError, TransactionStore, allowed_previous},
    usage::{UsageEvent, UsageReporter},
    webhook::TransactionNotifier,
};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A leased job as a worker would hand it to `process`.
pub fn borrowed_job<T>(id: impl Into<String>, data: T, attempts: u32) -> BorrowedJob<T> {
    BorrowedJob::new(
        Job {
            id: id.into(),
            data,
            attempts,
            created_at: 0,
            processed_at: None,
            finished_at: None,
        },
        "test-lease".to_string(),
    )
}

/// A JSON-RPC error response the way a node sends it.
pub fn rpc_error(chain_id: u64, message: &str) -> EngineError {
    EngineError::RpcError {
        chain_id,
        rpc_url: "http://mock.rpc".to_string(),
        message: message.to_string(),
        kind: RpcErrorKind::ErrorResp(RpcErrorResponse {
            code: -32000,
            message: message.to_string(),
            data: None,
        }),
    }
}

#[derive(Default)]
pub struct MemoryTransactionStore {
    records: Mutex<HashMap<String, TransactionRecord>>,
    writes: AtomicUsize,
}

impl MemoryTransactionStore {
    /// Successful inserts and updates so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn record(&self, queue_id: &str) -> Option<TransactionRecord> {
        lock(&self.records).get(queue_id).cloned()
    }

    /// Overwrites without any checks, bumping the version like a concurrent writer would.
    pub fn force(&self, mut record: TransactionRecord) {
        record.version += 1;
        lock(&self.records).insert(record.queue_id.clone(), record);
    }
}

#[async_trait]
impl TransactionStore for MemoryTransactionStore {
    async fn insert(&self, record: &TransactionRecord) -> Result<(), StoreError> {
        let mut records = lock(&self.records);
        if records.contains_key(&record.queue_id) {
            return Err(StoreError::AlreadyExists {
                queue_id: record.queue_id.clone(),
            });
        }
        records.insert(record.queue_id.clone(), record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, queue_id: &str) -> Result<Option<TransactionRecord>, StoreError> {
        Ok(self.record(queue_id))
    }

    async fn update(&self, mut record: TransactionRecord) -> Result<TransactionRecord, StoreError> {
        let mut records = lock(&self.records);
        let Some(current) = records.get(&record.queue_id) else {
            return Err(StoreError::NotFound {
                queue_id: record.queue_id,
            });
        };
        if current.version != record.version {
            return Err(StoreError::VersionConflict {
                queue_id: record.queue_id,
                expected: record.version,
            });
        }
        if !allowed_previous(record.status).contains(&current.status) {
            return Err(StoreError::InvalidTransition {
                queue_id: record.queue_id,
                from: current.status,
                to: record.status,
            });
        }

        record.version += 1;
        records.insert(record.queue_id.clone(), record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(record)
    }
}

#[derive(Debug, Default, Clone)]
struct WalletLedger {
    next: Option<u64>,
    in_flight: BTreeSet<u64>,
    recyclable: BTreeSet<u64>,
}

/// Same semantics as the Redis ledger, held in one mutex.
#[derive(Default)]
pub struct MemoryNonceLedger {
    wallets: Mutex<HashMap<(u64, Address), WalletLedger>>,
    failing_releases: AtomicUsize,
}

impl MemoryNonceLedger {
    /// The next `count` calls to `remove_from_in_flight` or `recycle` fail.
    pub fn fail_next_releases(&self, count: usize) {
        self.failing_releases.store(count, Ordering::SeqCst);
    }

    fn release_failure(&self) -> Result<(), NonceLedgerError> {
        match self
            .failing_releases
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            Ok(_) => Err(NonceLedgerError::Internal {
                message: "ledger unavailable".to_string(),
            }),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl NonceLedger for MemoryNonceLedger {
    async fn allocate(&self, chain_id: u64, address: Address) -> Result<u64, NonceLedgerError> {
        let mut wallets = lock(&self.wallets);
        let wallet = wallets.entry((chain_id, address)).or_default();
        let Some(next) = wallet.next else {
            return Err(NonceLedgerError::NeedsSync { chain_id, address });
        };

        let nonce = match wallet.recyclable.pop_first() {
            Some(recycled) => recycled,
            None => {
                wallet.next = Some(next + 1);
                next
            }
        };
        wallet.in_flight.insert(nonce);
        Ok(nonce)
    }

    async fn mark_in_flight(
        &self,
        chain_id: u64,
        address: Address,
        nonce: u64,
    ) -> Result<(), NonceLedgerError> {
        lock(&self.wallets)
            .entry((chain_id, address))
            .or_default()
            .in_flight
            .insert(nonce);
        Ok(())
    }

    async fn remove_from_in_flight(
        &self,
        chain_id: u64,
        address: Address,
        nonce: u64,
    ) -> Result<bool, NonceLedgerError> {
        self.release_failure()?;
        Ok(lock(&self.wallets)
            .entry((chain_id, address))
            .or_default()
            .in_flight
            .remove(&nonce))
    }

    async fn recycle(
        &self,
        chain_id: u64,
        address: Address,
        nonce: u64,
    ) -> Result<(), NonceLedgerError> {
        self.release_failure()?;
        let mut wallets = lock(&self.wallets);
        let wallet = wallets.entry((chain_id, address)).or_default();
        if wallet.next.is_some_and(|next| nonce < next) {
            wallet.recyclable.insert(nonce);
        }
        Ok(())
    }

    async fn sync(
        &self,
        chain_id: u64,
        address: Address,
        onchain_next: u64,
    ) -> Result<u64, NonceLedgerError> {
        let mut wallets = lock(&self.wallets);
        let wallet = wallets.entry((chain_id, address)).or_default();
        match wallet.next {
            Some(current) if current >= onchain_next => Ok(current),
            _ => {
                wallet.next = Some(onchain_next);
                wallet.recyclable.retain(|n| *n >= onchain_next);
                Ok(onchain_next)
            }
        }
    }

    async fn snapshot(
        &self,
        chain_id: u64,
        address: Address,
    ) -> Result<NonceSnapshot, NonceLedgerError> {
        let wallets = lock(&self.wallets);
        let wallet = wallets.get(&(chain_id, address)).cloned().unwrap_or_default();
        Ok(NonceSnapshot {
            next_nonce: wallet.next,
            in_flight: wallet.in_flight.into_iter().collect(),
            recyclable: wallet.recyclable.into_iter().collect(),
        })
    }
}

/// Records jobs instead of queueing them. Send jobs dedupe by id and count as pending until
/// removed.
#[derive(Default)]
pub struct RecordingJobProducer {
    sends: Mutex<Vec<SendJobData>>,
    mines: Mutex<Vec<MineJobData>>,
    pending_sends: Mutex<HashSet<String>>,
    removed: Mutex<Vec<(String, u32)>>,
    failing_sends: AtomicUsize,
}

impl RecordingJobProducer {
    /// The next `count` send enqueues fail.
    pub fn fail_next_sends(&self, count: usize) {
        self.failing_sends.store(count, Ordering::SeqCst);
    }

    pub fn sends(&self) -> Vec<SendJobData> {
        lock(&self.sends).clone()
    }

    pub fn mines(&self) -> Vec<MineJobData> {
        lock(&self.mines).clone()
    }

    /// Every `remove_send` call, hit or miss.
    pub fn removal_attempts(&self) -> Vec<(String, u32)> {
        lock(&self.removed).clone()
    }

    pub fn is_pending(&self, queue_id: &str, resend_count: u32) -> bool {
        lock(&self.pending_sends).contains(&send_job_id(queue_id, resend_count))
    }
}

#[async_trait]
impl JobProducer for RecordingJobProducer {
    async fn enqueue_send(&self, job: SendJobData) -> Result<(), EngineError> {
        if self
            .failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(EngineError::InternalError {
                message: "queue unavailable".to_string(),
            });
        }

        let mut sends = lock(&self.sends);
        if sends.iter().any(|queued| queued.job_id() == job.job_id()) {
            return Ok(());
        }
        lock(&self.pending_sends).insert(job.job_id());
        sends.push(job);
        Ok(())
    }

    async fn enqueue_mine(&self, job: MineJobData) -> Result<(), EngineError> {
        lock(&self.mines).push(job);
        Ok(())
    }

    async fn remove_send(&self, queue_id: &str, resend_count: u32) -> Result<bool, EngineError> {
        lock(&self.removed).push((queue_id.to_string(), resend_count));
        Ok(lock(&self.pending_sends).remove(&send_job_id(queue_id, resend_count)))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    notifications: Mutex<Vec<TransactionRecord>>,
}

impl RecordingNotifier {
    pub fn notifications(&self) -> Vec<TransactionRecord> {
        lock(&self.notifications).clone()
    }
}

impl TransactionNotifier for RecordingNotifier {
    fn notify(&self, record: &TransactionRecord) {
        lock(&self.notifications).push(record.clone());
    }
}

#[derive(Default)]
pub struct RecordingUsageReporter {
    events: Mutex<Vec<UsageEvent>>,
}

impl RecordingUsageReporter {
    pub fn events(&self) -> Vec<UsageEvent> {
        lock(&self.events).clone()
    }
}

impl UsageReporter for RecordingUsageReporter {
    fn report(&self, event: UsageEvent) {
        lock(&self.events).push(event);
    }
}

/// Signs by hashing the JSON form of the transaction. Deterministic and key-free.
#[derive(Default)]
pub struct StaticSigner {
    signed: Mutex<Vec<TypedTransaction>>,
}

impl StaticSigner {
    pub fn signed(&self) -> Vec<TypedTransaction> {
        lock(&self.signed).clone()
    }
}

#[async_trait]
impl TransactionSigner for StaticSigner {
    async fn sign_transaction(
        &self,
        _from: Address,
        tx: TypedTransaction,
    ) -> Result<SignedTransaction, EngineError> {
        let raw = serde_json::to_vec(&tx)?;
        lock(&self.signed).push(tx);
        Ok(SignedTransaction {
            hash: keccak256(&raw),
            raw: Bytes::from(raw),
        })
    }
}

#[derive(Debug)]
struct MockChainState {
    block_number: u64,
    pending_counts: HashMap<Address, u64>,
    fees: NetworkFees,
    gas_estimate: u64,
    broadcast_errors: VecDeque<EngineError>,
    broadcasts: Vec<B256>,
    receipts: HashMap<B256, ReceiptSummary>,
    failing_receipts: HashSet<B256>,
    user_ops: Vec<serde_json::Value>,
    user_op_receipts: HashMap<B256, UserOpReceiptSummary>,
}

/// A scriptable chain. Clones share state.
#[derive(Debug, Clone)]
pub struct MockChain {
    chain_id: u64,
    state: Arc<Mutex<MockChainState>>,
}

impl MockChain {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            state: Arc::new(Mutex::new(MockChainState {
                block_number: 100,
                pending_counts: HashMap::new(),
                fees: NetworkFees {
                    max_fee_per_gas: 100_000_000_000,
                    max_priority_fee_per_gas: 2_000_000_000,
                },
                gas_estimate: 50_000,
                broadcast_errors: VecDeque::new(),
                broadcasts: Vec::new(),
                receipts: HashMap::new(),
                failing_receipts: HashSet::new(),
                user_ops: Vec::new(),
                user_op_receipts: HashMap::new(),
            })),
        }
    }

    pub fn set_block_number(&self, block: u64) {
        lock(&self.state).block_number = block;
    }

    pub fn advance_blocks(&self, blocks: u64) {
        lock(&self.state).block_number += blocks;
    }

    pub fn set_pending_count(&self, address: Address, count: u64) {
        lock(&self.state).pending_counts.insert(address, count);
    }

    pub fn set_fees(&self, fees: NetworkFees) {
        lock(&self.state).fees = fees;
    }

    /// The next broadcast fails with `error`.
    pub fn fail_next_broadcast(&self, error: EngineError) {
        lock(&self.state).broadcast_errors.push_back(error);
    }

    /// Hashes of successful broadcasts, in order.
    pub fn broadcasts(&self) -> Vec<B256> {
        lock(&self.state).broadcasts.clone()
    }

    pub fn mine(&self, hash: B256, success: bool) {
        let mut state = lock(&self.state);
        let receipt = ReceiptSummary {
            transaction_hash: hash,
            block_number: state.block_number,
            status: success.into(),
            gas_used: 21_000,
            effective_gas_price: 1_000_000_000,
            cumulative_gas_used: 42_000,
            transaction_type: 2,
        };
        state.receipts.insert(hash, receipt);
    }

    /// Receipt lookups for `hash` error out.
    pub fn fail_receipt_lookups(&self, hash: B256) {
        lock(&self.state).failing_receipts.insert(hash);
    }

    pub fn user_ops(&self) -> Vec<serde_json::Value> {
        lock(&self.state).user_ops.clone()
    }

    /// Includes a user operation in a bundle transaction `bundle_hash`.
    pub fn mine_user_op(&self, user_op_hash: B256, bundle_hash: B256, sender: Address, success: bool) {
        self.mine(bundle_hash, true);
        lock(&self.state).user_op_receipts.insert(
            user_op_hash,
            UserOpReceiptSummary {
                success,
                sender,
                nonce: "0x1".to_string(),
                transaction_hash: bundle_hash,
            },
        );
    }
}

#[async_trait]
impl Chain for MockChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn block_number(&self) -> Result<u64, EngineError> {
        Ok(lock(&self.state).block_number)
    }

    async fn pending_transaction_count(&self, address: Address) -> Result<u64, EngineError> {
        Ok(lock(&self.state)
            .pending_counts
            .get(&address)
            .copied()
            .unwrap_or_default())
    }

    async fn estimate_fees(&self) -> Result<NetworkFees, EngineError> {
        Ok(lock(&self.state).fees)
    }

    async fn estimate_gas(&self, _request: &RpcTransactionRequest) -> Result<u64, EngineError> {
        Ok(lock(&self.state).gas_estimate)
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<B256, EngineError> {
        let mut state = lock(&self.state);
        if let Some(error) = state.broadcast_errors.pop_front() {
            return Err(error);
        }
        let hash = keccak256(raw);
        state.broadcasts.push(hash);
        Ok(hash)
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<ReceiptSummary>, EngineError> {
        let state = lock(&self.state);
        if state.failing_receipts.contains(&hash) {
            return Err(EngineError::RpcError {
                chain_id: self.chain_id,
                rpc_url: "http://mock.rpc".to_string(),
                message: "request timed out".to_string(),
                kind: RpcErrorKind::OtherTransportError {
                    message: "request timed out".to_string(),
                },
            });
        }
        Ok(state.receipts.get(&hash).cloned())
    }

    async fn transaction_by_hash(
        &self,
        hash: B256,
    ) -> Result<Option<TransactionSummary>, EngineError> {
        Ok(lock(&self.state)
            .receipts
            .get(&hash)
            .map(|receipt| TransactionSummary {
                hash,
                block_number: Some(receipt.block_number),
            }))
    }

    async fn send_user_operation(
        &self,
        user_op: &serde_json::Value,
        _entrypoint: Address,
    ) -> Result<B256, EngineError> {
        let hash = keccak256(serde_json::to_vec(user_op)?);
        lock(&self.state).user_ops.push(user_op.clone());
        Ok(hash)
    }

    async fn user_operation_receipt(
        &self,
        user_op_hash: B256,
    ) -> Result<Option<UserOpReceiptSummary>, EngineError> {
        Ok(lock(&self.state).user_op_receipts.get(&user_op_hash).cloned())
    }
}

pub struct MockChainService {
    pub chain: MockChain,
}

impl ChainService for MockChainService {
    fn get_chain(&self, chain_id: u64) -> Result<impl Chain, EngineError> {
        if chain_id != self.chain.chain_id {
            return Err(EngineError::RpcConfigError {
                message: format!("Chain {chain_id} is not configured"),
            });
        }
        Ok(self.chain.clone())
    }
}

/// Every double wired together, plus constructors for the stages under test.
pub struct TestRelay {
    pub store: Arc<MemoryTransactionStore>,
    pub ledger: Arc<MemoryNonceLedger>,
    pub jobs: Arc<RecordingJobProducer>,
    pub signer: Arc<StaticSigner>,
    pub notifier: Arc<RecordingNotifier>,
    pub usage: Arc<RecordingUsageReporter>,
    pub chain: MockChain,
    pub chain_service: Arc<MockChainService>,
    pub config: RelayConfig,
}

pub const TEST_CHAIN_ID: u64 = 1337;

impl TestRelay {
    pub fn new(config: RelayConfig) -> Self {
        let chain = MockChain::new(TEST_CHAIN_ID);
        Self {
            store: Arc::default(),
            ledger: Arc::default(),
            jobs: Arc::default(),
            signer: Arc::default(),
            notifier: Arc::default(),
            usage: Arc::default(),
            chain_service: Arc::new(MockChainService {
                chain: chain.clone(),
            }),
            chain,
            config,
        }
    }

    pub fn services(&self) -> RelayServices {
        RelayServices {
            store: self.store.clone(),
            ledger: self.ledger.clone(),
            jobs: self.jobs.clone(),
            signer: self.signer.clone(),
            notifier: self.notifier.clone(),
            usage: self.usage.clone(),
            config: Arc::new(StaticRelayConfigProvider(self.config)),
        }
    }

    pub fn send_handler(&self) -> SendHandler<MockChainService> {
        SendHandler::new(self.chain_service.clone(), self.services())
    }

    pub fn mine_handler(&self) -> MineHandler<MockChainService> {
        MineHandler::new(self.chain_service.clone(), self.services())
    }

    pub fn cancellation(&self) -> CancellationFlow<MockChainService> {
        CancellationFlow::new(self.chain_service.clone(), self.services())
    }

    /// A plain contract call from `from`.
    pub fn request(&self, from: Address) -> SubmitTransactionRequest {
        SubmitTransactionRequest {
            chain_id: TEST_CHAIN_ID,
            from,
            to: Some(Address::repeat_byte(0xc0)),
            data: Bytes::from_static(&[0xa9, 0x05, 0x9c, 0xbb]),
            value: Default::default(),
            gas: None,
            max_fee_per_gas: None,
            max_priority_fee_per_gas: None,
            user_operation: None,
            idempotency_key: None,
        }
    }

    /// Stores a queued record the way the submission entry point does.
    pub async fn queue(&self, queue_id: &str, request: SubmitTransactionRequest) -> TransactionRecord {
        let record = TransactionRecord::queued(queue_id.to_string(), request, Utc::now());
        self.store
            .insert(&record)
            .await
            .expect("fresh queue id");
        record
    }

    pub fn record(&self, queue_id: &str) -> TransactionRecord {
        self.store.record(queue_id).expect("record exists")
    }
}
