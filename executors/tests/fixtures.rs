#![allow(dead_code)]

use alloy::{
    consensus::{Transaction, TypedTransaction},
    primitives::{Address, B256},
};
use relay_core::transaction::{GasParams, TransactionRecord, TransactionStatus};
use relay_executors::{
    config::RelayConfig,
    jobs::{MineJobData, SendJobData},
    mine::MineOutcome,
    send::SendOutcome,
    store::TransactionStore,
    test_utils::{TEST_CHAIN_ID, TestRelay, borrowed_job},
};
use relay_queue::{
    DurableExecution, FailHookData,
    hooks::TransactionContext,
    job::{JobError, JobResult},
};

pub const REDIS_URL: &str = "redis://127.0.0.1:6379/";

pub fn setup_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_executors=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

pub fn wallet(byte: u8) -> Address {
    Address::repeat_byte(byte)
}

pub fn relay(max_retries_per_tx: u32, min_elapsed_blocks_before_retry: u64) -> TestRelay {
    setup_tracing();
    TestRelay::new(RelayConfig {
        max_retries_per_tx,
        min_elapsed_blocks_before_retry,
    })
}

pub async fn run_send(
    relay: &TestRelay,
    queue_id: &str,
    resend_count: u32,
    attempts: u32,
) -> JobResult<SendOutcome, relay_executors::send::SendError> {
    let data = SendJobData {
        queue_id: queue_id.to_string(),
        resend_count,
    };
    let job = borrowed_job(data.job_id(), data, attempts);
    relay.send_handler().process(&job).await
}

pub async fn run_mine(
    relay: &TestRelay,
    queue_id: &str,
    attempts: u32,
) -> JobResult<MineOutcome, relay_executors::mine::MineError> {
    let job = borrowed_job(
        queue_id,
        MineJobData {
            queue_id: queue_id.to_string(),
        },
        attempts,
    );
    relay.mine_handler().process(&job).await
}

/// Runs the mine stage and, if it fails the job, the fail hook the worker would run.
pub async fn run_mine_to_completion(
    relay: &TestRelay,
    queue_id: &str,
    attempts: u32,
) -> JobResult<MineOutcome, relay_executors::mine::MineError> {
    let handler = relay.mine_handler();
    let job = borrowed_job(
        queue_id,
        MineJobData {
            queue_id: queue_id.to_string(),
        },
        attempts,
    );
    let result = handler.process(&job).await;
    if let Err(JobError::Fail(error)) = &result {
        let mut pipeline = relay_queue::redis::pipe();
        let mut tx = TransactionContext::new(&mut pipeline, "mine".to_string());
        handler.on_fail(&job, FailHookData { error }, &mut tx).await;
    }
    result
}

/// Queues a record and moves it straight to `sent` with the given broadcasts.
pub async fn sent_record(
    relay: &TestRelay,
    queue_id: &str,
    from: Address,
    nonce: u64,
    hashes: Vec<B256>,
    sent_at_block: u64,
) -> TransactionRecord {
    let mut record = relay.queue(queue_id, relay.request(from)).await;
    record.status = TransactionStatus::Sent;
    record.nonce = Some(nonce as i64);
    record.resend_count = hashes.len().saturating_sub(1) as u32;
    record.sent_transaction_hashes = hashes;
    record.sent_at = Some(chrono::Utc::now());
    record.sent_at_block = Some(sent_at_block);
    record.sent_gas = Some(GasParams {
        gas_limit: 50_000,
        max_fee_per_gas: 100_000_000_000,
        max_priority_fee_per_gas: 2_000_000_000,
    });
    relay.store.update(record).await.unwrap()
}

/// Queues a record whose first send claimed `nonce` and then died before recording a broadcast.
pub async fn claimed_record(
    relay: &TestRelay,
    queue_id: &str,
    from: Address,
    nonce: u64,
) -> TransactionRecord {
    use relay_executors::nonce_ledger::NonceLedger;

    relay
        .ledger
        .sync(TEST_CHAIN_ID, from, nonce + 1)
        .await
        .unwrap();
    relay
        .ledger
        .mark_in_flight(TEST_CHAIN_ID, from, nonce)
        .await
        .unwrap();

    let mut record = relay.queue(queue_id, relay.request(from)).await;
    record.nonce = Some(nonce as i64);
    record.sent_gas = Some(GasParams {
        gas_limit: 50_000,
        max_fee_per_gas: 100_000_000_000,
        max_priority_fee_per_gas: 2_000_000_000,
    });
    relay.store.update(record).await.unwrap()
}

pub fn fees_of(tx: &TypedTransaction) -> (u128, u128) {
    (
        tx.max_fee_per_gas(),
        tx.max_priority_fee_per_gas().unwrap_or_default(),
    )
}

pub fn hash(byte: u8) -> B256 {
    B256::repeat_byte(byte)
}
