mod fixtures;

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use alloy::consensus::Transaction;
use async_trait::async_trait;
use fixtures::*;
use futures::future::join_all;
use relay_core::{
    chain::NetworkFees,
    transaction::{TransactionRecord, TransactionStatus, UserOperationRequest},
};
use relay_executors::{
    jobs::SendJobData,
    nonce_ledger::NonceLedger,
    send::{SendError, SendHandler, SendOutcome},
    store::{StoreError, TransactionStore},
    test_utils::{
        MemoryTransactionStore, MockChainService, TEST_CHAIN_ID, TestRelay, borrowed_job,
        rpc_error,
    },
};
use relay_queue::{
    DurableExecution, FailHookData,
    hooks::TransactionContext,
    job::{BorrowedJob, JobError},
    redis,
};

/// The in-memory store, with reads that hand control to other tasks and writes that can fail.
struct ScriptedStore {
    inner: Arc<MemoryTransactionStore>,
    yield_after_get: bool,
    failing_sent_writes: AtomicUsize,
}

impl ScriptedStore {
    fn interleaving(inner: Arc<MemoryTransactionStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            yield_after_get: true,
            failing_sent_writes: AtomicUsize::new(0),
        })
    }

    fn failing_sent_writes(inner: Arc<MemoryTransactionStore>, count: usize) -> Arc<Self> {
        Arc::new(Self {
            inner,
            yield_after_get: false,
            failing_sent_writes: AtomicUsize::new(count),
        })
    }
}

#[async_trait]
impl TransactionStore for ScriptedStore {
    async fn insert(&self, record: &TransactionRecord) -> Result<(), StoreError> {
        self.inner.insert(record).await
    }

    async fn get(&self, queue_id: &str) -> Result<Option<TransactionRecord>, StoreError> {
        let record = self.inner.get(queue_id).await;
        if self.yield_after_get {
            tokio::task::yield_now().await;
        }
        record
    }

    async fn update(&self, record: TransactionRecord) -> Result<TransactionRecord, StoreError> {
        if record.status == TransactionStatus::Sent
            && self
                .failing_sent_writes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(StoreError::RedisError(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connection reset",
            ))));
        }
        self.inner.update(record).await
    }
}

fn handler_with_store(relay: &TestRelay, store: Arc<ScriptedStore>) -> SendHandler<MockChainService> {
    let mut services = relay.services();
    services.store = store as Arc<dyn TransactionStore>;
    SendHandler::new(relay.chain_service.clone(), services)
}

fn first_send_job(queue_id: &str, attempts: u32) -> BorrowedJob<SendJobData> {
    let data = SendJobData {
        queue_id: queue_id.to_string(),
        resend_count: 0,
    };
    borrowed_job(data.job_id(), data, attempts)
}

#[tokio::test]
async fn first_send_syncs_ledger_and_marks_sent() {
    let relay = relay(3, 5);
    let from = wallet(0x01);
    relay.chain.set_pending_count(from, 7);
    relay.queue("tx-a", relay.request(from)).await;

    let outcome = run_send(&relay, "tx-a", 0, 1).await.unwrap();

    let record = relay.record("tx-a");
    assert_eq!(record.status, TransactionStatus::Sent);
    assert_eq!(record.nonce, Some(7));
    assert_eq!(record.sent_transaction_hashes, relay.chain.broadcasts());
    assert_eq!(record.sent_transaction_hashes.len(), 1);
    assert_eq!(record.sent_at_block, Some(100));
    assert!(matches!(outcome, SendOutcome::Sent { nonce: Some(7), .. }));

    let snapshot = relay.ledger.snapshot(TEST_CHAIN_ID, from).await.unwrap();
    assert_eq!(snapshot.next_nonce, Some(8));
    assert_eq!(snapshot.in_flight, vec![7]);

    assert_eq!(relay.jobs.mines().len(), 1);
    assert_eq!(relay.jobs.mines()[0].queue_id, "tx-a");

    let notifications = relay.notifier.notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].status, TransactionStatus::Sent);
}

#[tokio::test]
async fn concurrent_sends_from_one_wallet_never_share_a_nonce() {
    let relay = relay(3, 5);
    let from = wallet(0x02);
    relay.ledger.sync(TEST_CHAIN_ID, from, 0).await.unwrap();

    for i in 0..12 {
        relay.queue(&format!("tx-{i}"), relay.request(from)).await;
    }

    let runs = (0..12).map(|i| {
        let relay = &relay;
        async move { run_send(relay, &format!("tx-{i}"), 0, 1).await }
    });
    for result in join_all(runs).await {
        result.unwrap();
    }

    let mut nonces: Vec<i64> = (0..12)
        .map(|i| relay.record(&format!("tx-{i}")).nonce.unwrap())
        .collect();
    nonces.sort_unstable();
    assert_eq!(nonces, (0..12).collect::<Vec<i64>>());
}

#[tokio::test]
async fn resend_reuses_nonce_and_raises_fees() {
    let relay = relay(3, 5);
    let from = wallet(0x03);
    relay.chain.set_pending_count(from, 4);
    relay.queue("tx-r", relay.request(from)).await;

    run_send(&relay, "tx-r", 0, 1).await.unwrap();
    let first = relay.record("tx-r");

    // one block later: below the threshold, no resend yet
    relay.chain.advance_blocks(1);
    assert!(run_mine(&relay, "tx-r", 1).await.unwrap_err().is_nack());
    assert!(relay.jobs.sends().is_empty());

    relay.chain.advance_blocks(4);
    assert!(run_mine(&relay, "tx-r", 2).await.unwrap_err().is_nack());
    let sends = relay.jobs.sends();
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].resend_count, 1);

    run_send(&relay, "tx-r", 1, 1).await.unwrap();

    let resent = relay.record("tx-r");
    assert_eq!(resent.status, TransactionStatus::Sent);
    assert_eq!(resent.nonce, first.nonce);
    assert_eq!(resent.resend_count, 1);
    assert_eq!(resent.sent_transaction_hashes.len(), 2);
    assert_eq!(resent.sent_transaction_hashes[0], first.sent_transaction_hashes[0]);
    assert_eq!(resent.sent_at_block, Some(105));

    let signed = relay.signer.signed();
    assert_eq!(signed.len(), 2);
    assert_eq!(signed[0].nonce(), signed[1].nonce());
    let (first_max, first_prio) = fees_of(&signed[0]);
    let (second_max, second_prio) = fees_of(&signed[1]);
    assert!(second_max > first_max);
    assert!(second_prio > first_prio);

    // the nonce never left the in-flight set
    let snapshot = relay.ledger.snapshot(TEST_CHAIN_ID, from).await.unwrap();
    assert_eq!(snapshot.in_flight, vec![4]);
    assert_eq!(snapshot.next_nonce, Some(5));
}

#[tokio::test]
async fn nonce_too_low_drops_nonce_and_resyncs() {
    let relay = relay(3, 5);
    let from = wallet(0x04);
    relay.ledger.sync(TEST_CHAIN_ID, from, 3).await.unwrap();
    relay.chain.set_pending_count(from, 5);
    relay
        .chain
        .fail_next_broadcast(rpc_error(TEST_CHAIN_ID, "nonce too low: next nonce 5, tx nonce 3"));
    relay.queue("tx-low", relay.request(from)).await;

    let err = run_send(&relay, "tx-low", 0, 1).await.unwrap_err();
    assert!(err.is_nack());
    assert!(matches!(err.error(), SendError::BroadcastRejected { .. }));

    let snapshot = relay.ledger.snapshot(TEST_CHAIN_ID, from).await.unwrap();
    assert_eq!(snapshot.next_nonce, Some(5));
    assert!(snapshot.in_flight.is_empty());
    assert!(snapshot.recyclable.is_empty());

    assert_eq!(relay.record("tx-low").status, TransactionStatus::Queued);
}

#[tokio::test]
async fn rejected_first_send_returns_nonce_for_reuse() {
    let relay = relay(3, 5);
    let from = wallet(0x05);
    relay.ledger.sync(TEST_CHAIN_ID, from, 10).await.unwrap();
    relay.chain.fail_next_broadcast(rpc_error(
        TEST_CHAIN_ID,
        "insufficient funds for gas * price + value",
    ));
    relay.queue("tx-poor", relay.request(from)).await;

    match run_send(&relay, "tx-poor", 0, 1).await {
        Err(JobError::Nack { delay, .. }) => assert_eq!(delay, Some(Duration::from_secs(60))),
        other => panic!("expected a nack, got {other:?}"),
    }

    let snapshot = relay.ledger.snapshot(TEST_CHAIN_ID, from).await.unwrap();
    assert_eq!(snapshot.recyclable, vec![10]);
    assert!(snapshot.in_flight.is_empty());
    assert_eq!(relay.record("tx-poor").nonce, None);

    // the retry picks the same nonce back up
    run_send(&relay, "tx-poor", 0, 2).await.unwrap();
    assert_eq!(relay.record("tx-poor").nonce, Some(10));
}

#[tokio::test]
async fn already_known_counts_as_broadcast() {
    let relay = relay(3, 5);
    let from = wallet(0x06);
    relay.ledger.sync(TEST_CHAIN_ID, from, 0).await.unwrap();
    relay
        .chain
        .fail_next_broadcast(rpc_error(TEST_CHAIN_ID, "already known"));
    relay.queue("tx-known", relay.request(from)).await;

    run_send(&relay, "tx-known", 0, 1).await.unwrap();

    let record = relay.record("tx-known");
    assert_eq!(record.status, TransactionStatus::Sent);
    assert_eq!(record.sent_transaction_hashes.len(), 1);
    assert!(relay.chain.broadcasts().is_empty());
}

#[tokio::test]
async fn stale_send_job_changes_nothing() {
    let relay = relay(3, 5);
    let from = wallet(0x07);
    let mut record = relay.queue("tx-stale", relay.request(from)).await;
    record.status = TransactionStatus::Cancelled;
    relay.store.force(record);
    let writes = relay.store.writes();

    let outcome = run_send(&relay, "tx-stale", 0, 1).await.unwrap();

    assert!(matches!(outcome, SendOutcome::Skipped { .. }));
    assert_eq!(relay.store.writes(), writes);
    assert!(relay.chain.broadcasts().is_empty());
    assert!(relay.notifier.notifications().is_empty());
}

#[tokio::test]
async fn redelivered_send_only_reenqueues_mine_job() {
    let relay = relay(3, 5);
    let from = wallet(0x08);
    relay.ledger.sync(TEST_CHAIN_ID, from, 0).await.unwrap();
    relay.queue("tx-twice", relay.request(from)).await;

    run_send(&relay, "tx-twice", 0, 1).await.unwrap();
    let outcome = run_send(&relay, "tx-twice", 0, 2).await.unwrap();

    assert!(matches!(outcome, SendOutcome::Skipped { .. }));
    assert_eq!(relay.chain.broadcasts().len(), 1);
    assert_eq!(relay.record("tx-twice").sent_transaction_hashes.len(), 1);
    assert_eq!(relay.jobs.mines().len(), 2);
}

#[tokio::test]
async fn exhausted_first_send_stays_queued_with_error() {
    let relay = relay(3, 5);
    let from = wallet(0x09);
    relay.ledger.sync(TEST_CHAIN_ID, from, 0).await.unwrap();
    relay
        .chain
        .fail_next_broadcast(rpc_error(TEST_CHAIN_ID, "exceeds block gas limit"));
    relay.queue("tx-budget", relay.request(from)).await;

    let handler = relay.send_handler().with_retry_config(3, Duration::from_secs(1));
    let data = relay_executors::jobs::SendJobData {
        queue_id: "tx-budget".to_string(),
        resend_count: 0,
    };
    let job = relay_executors::test_utils::borrowed_job(data.job_id(), data, 3);

    let Err(JobError::Fail(error)) = handler.process(&job).await else {
        panic!("expected the job to fail");
    };

    let mut pipeline = relay_queue::redis::pipe();
    let mut tx = TransactionContext::new(&mut pipeline, "send".to_string());
    handler
        .on_fail(&job, FailHookData { error: &error }, &mut tx)
        .await;

    let record = relay.record("tx-budget");
    assert_eq!(record.status, TransactionStatus::Queued);
    assert!(record.error_message.unwrap().contains("gas limit"));

    // the rejected nonce went back to the ledger
    let snapshot = relay.ledger.snapshot(TEST_CHAIN_ID, from).await.unwrap();
    assert_eq!(snapshot.recyclable, vec![0]);
}

#[tokio::test]
async fn user_operation_goes_to_bundler_without_nonce() {
    let relay = relay(3, 5);
    let from = wallet(0x0a);
    let mut request = relay.request(from);
    request.user_operation = Some(UserOperationRequest {
        entrypoint: wallet(0xee),
        user_operation: serde_json::json!({ "sender": from.to_string(), "nonce": "0x1" }),
    });
    relay.queue("op-1", request).await;

    run_send(&relay, "op-1", 0, 1).await.unwrap();

    let record = relay.record("op-1");
    assert_eq!(record.status, TransactionStatus::Sent);
    assert!(record.user_op_hash.is_some());
    assert!(record.nonce.is_none());
    assert_eq!(relay.chain.user_ops().len(), 1);
    assert!(relay.chain.broadcasts().is_empty());

    let snapshot = relay.ledger.snapshot(TEST_CHAIN_ID, from).await.unwrap();
    assert_eq!(snapshot.next_nonce, None);
}

#[tokio::test]
async fn duplicate_deliveries_of_a_first_send_broadcast_once() {
    let relay = relay(3, 5);
    let from = wallet(0x0b);
    relay.ledger.sync(TEST_CHAIN_ID, from, 0).await.unwrap();
    relay.queue("tx-dup", relay.request(from)).await;
    let handler = handler_with_store(&relay, ScriptedStore::interleaving(relay.store.clone()));

    let (first, second) = (first_send_job("tx-dup", 1), first_send_job("tx-dup", 2));
    let (a, b) = futures::join!(handler.process(&first), handler.process(&second));
    let outcomes = [a.unwrap(), b.unwrap()];

    assert_eq!(
        outcomes
            .iter()
            .filter(|outcome| matches!(outcome, SendOutcome::Sent { .. }))
            .count(),
        1
    );

    let record = relay.record("tx-dup");
    assert_eq!(record.status, TransactionStatus::Sent);
    assert_eq!(record.nonce, Some(0));
    assert_eq!(record.sent_transaction_hashes.len(), 1);

    // nothing was signed or broadcast at any other nonce
    assert!(relay.signer.signed().iter().all(|tx| tx.nonce() == 0));
    assert!(!relay.chain.broadcasts().is_empty());
    assert!(
        relay
            .chain
            .broadcasts()
            .iter()
            .all(|hash| *hash == record.sent_transaction_hashes[0])
    );

    let snapshot = relay.ledger.snapshot(TEST_CHAIN_ID, from).await.unwrap();
    assert_eq!(snapshot.in_flight, vec![0]);
    assert!(!snapshot.recyclable.contains(&0));
}

#[tokio::test]
async fn redelivery_after_a_claim_signs_the_pinned_transaction() {
    let relay = relay(3, 5);
    let from = wallet(0x0c);
    let claimed = claimed_record(&relay, "tx-claimed", from, 5).await;
    relay.chain.set_fees(NetworkFees {
        max_fee_per_gas: 300_000_000_000,
        max_priority_fee_per_gas: 9_000_000_000,
    });

    run_send(&relay, "tx-claimed", 0, 2).await.unwrap();

    let signed = relay.signer.signed();
    assert_eq!(signed.len(), 1);
    assert_eq!(signed[0].nonce(), 5);
    let pinned = claimed.sent_gas.unwrap();
    assert_eq!(
        fees_of(&signed[0]),
        (pinned.max_fee_per_gas, pinned.max_priority_fee_per_gas)
    );

    let record = relay.record("tx-claimed");
    assert_eq!(record.status, TransactionStatus::Sent);
    assert_eq!(record.nonce, Some(5));

    let snapshot = relay.ledger.snapshot(TEST_CHAIN_ID, from).await.unwrap();
    assert_eq!(snapshot.in_flight, vec![5]);
    assert_eq!(snapshot.next_nonce, Some(6));
}

#[tokio::test]
async fn occupied_claimed_nonce_counts_as_broadcast() {
    let relay = relay(3, 5);
    let from = wallet(0x0d);
    claimed_record(&relay, "tx-occupied", from, 5).await;
    relay
        .chain
        .fail_next_broadcast(rpc_error(TEST_CHAIN_ID, "nonce too low: next nonce 6, tx nonce 5"));

    let outcome = run_send(&relay, "tx-occupied", 0, 2).await.unwrap();

    assert!(matches!(outcome, SendOutcome::Sent { nonce: Some(5), .. }));
    let record = relay.record("tx-occupied");
    assert_eq!(record.status, TransactionStatus::Sent);
    assert_eq!(record.sent_transaction_hashes.len(), 1);
    assert_eq!(relay.jobs.mines().len(), 1);

    // the earlier delivery's transaction holds the nonce
    let snapshot = relay.ledger.snapshot(TEST_CHAIN_ID, from).await.unwrap();
    assert_eq!(snapshot.in_flight, vec![5]);
    assert!(snapshot.recyclable.is_empty());
}

#[tokio::test]
async fn failed_record_write_retries_with_the_same_transaction() {
    let relay = relay(3, 5);
    let from = wallet(0x0e);
    relay.ledger.sync(TEST_CHAIN_ID, from, 2).await.unwrap();
    relay.queue("tx-write", relay.request(from)).await;
    let handler = handler_with_store(
        &relay,
        ScriptedStore::failing_sent_writes(relay.store.clone(), 1),
    );

    let err = handler
        .process(&first_send_job("tx-write", 1))
        .await
        .unwrap_err();
    assert!(err.is_nack());
    assert!(matches!(err.error(), SendError::RecordUpdateFailed { .. }));
    assert_eq!(relay.record("tx-write").nonce, Some(2));
    assert!(relay.jobs.mines().is_empty());

    handler
        .process(&first_send_job("tx-write", 2))
        .await
        .unwrap();

    let broadcasts = relay.chain.broadcasts();
    assert_eq!(broadcasts.len(), 2);
    assert_eq!(broadcasts[0], broadcasts[1]);

    let record = relay.record("tx-write");
    assert_eq!(record.status, TransactionStatus::Sent);
    assert_eq!(record.sent_transaction_hashes, vec![broadcasts[0]]);
    assert_eq!(relay.jobs.mines().len(), 1);

    let snapshot = relay.ledger.snapshot(TEST_CHAIN_ID, from).await.unwrap();
    assert_eq!(snapshot.in_flight, vec![2]);
    assert_eq!(snapshot.next_nonce, Some(3));
}
