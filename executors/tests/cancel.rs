mod fixtures;

use fixtures::*;
use relay_core::transaction::{CANCELLED_WHILE_QUEUED_NONCE, TransactionStatus};
use relay_executors::{
    cancel::{CANCELLATION_GAS_LIMIT, CANCELLED_MESSAGE, CancelError},
    jobs::{JobProducer, SendJobData},
    nonce_ledger::NonceLedger,
    test_utils::{TEST_CHAIN_ID, rpc_error},
    usage::UsageAction,
};

#[tokio::test]
async fn queued_transaction_is_cancelled_without_a_broadcast() {
    let relay = relay(2, 5);
    relay.queue("tx-cq", relay.request(wallet(0x21))).await;
    relay
        .jobs
        .enqueue_send(SendJobData {
            queue_id: "tx-cq".to_string(),
            resend_count: 0,
        })
        .await
        .unwrap();

    let response = relay.cancellation().cancel("tx-cq").await.unwrap();

    assert_eq!(response.queue_id, "tx-cq");
    assert_eq!(response.status, "success");
    assert_eq!(response.message, CANCELLED_MESSAGE);
    assert_eq!(response.transaction_hash, None);

    let attempts = relay.jobs.removal_attempts();
    assert_eq!(
        attempts.iter().map(|(_, count)| *count).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert!(!relay.jobs.is_pending("tx-cq", 0));

    let record = relay.record("tx-cq");
    assert_eq!(record.status, TransactionStatus::Cancelled);
    assert_eq!(record.nonce, Some(CANCELLED_WHILE_QUEUED_NONCE));
    assert!(record.sent_transaction_hashes.is_empty());
    assert!(record.cancelled_at.is_some());
    assert_eq!(record.sent_at_block, Some(100));
    assert!(relay.chain.broadcasts().is_empty());

    let events = relay.usage.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].action, UsageAction::CancelTx);
}

#[tokio::test]
async fn send_job_after_queued_cancel_is_skipped() {
    let relay = relay(2, 5);
    relay.queue("tx-late-send", relay.request(wallet(0x22))).await;
    relay.cancellation().cancel("tx-late-send").await.unwrap();

    run_send(&relay, "tx-late-send", 0, 1).await.unwrap();

    assert!(relay.chain.broadcasts().is_empty());
    assert_eq!(relay.record("tx-late-send").status, TransactionStatus::Cancelled);
}

#[tokio::test]
async fn sent_transaction_is_replaced_at_the_same_nonce() {
    let relay = relay(2, 5);
    let from = wallet(0x23);
    relay.ledger.sync(TEST_CHAIN_ID, from, 7).await.unwrap();
    relay.ledger.mark_in_flight(TEST_CHAIN_ID, from, 6).await.unwrap();
    sent_record(&relay, "tx-cs", from, 6, vec![hash(0x31)], 100).await;

    let response = relay.cancellation().cancel("tx-cs").await.unwrap();

    let replacement = relay.signer.signed().pop().unwrap();
    assert_eq!(alloy::consensus::Transaction::nonce(&replacement), 6);
    assert_eq!(alloy::consensus::Transaction::gas_limit(&replacement), CANCELLATION_GAS_LIMIT);
    let (max_fee, priority_fee) = fees_of(&replacement);
    assert!(max_fee > 100_000_000_000);
    assert!(priority_fee > 2_000_000_000);

    let record = relay.record("tx-cs");
    assert_eq!(record.status, TransactionStatus::Cancelled);
    assert_eq!(record.sent_transaction_hashes.len(), 2);
    assert_eq!(record.sent_transaction_hashes[0], hash(0x31));
    assert_eq!(response.transaction_hash, record.sent_transaction_hashes.last().copied());
    assert_eq!(relay.chain.broadcasts(), vec![record.sent_transaction_hashes[1]]);

    // the replacement owns the nonce now
    let snapshot = relay.ledger.snapshot(TEST_CHAIN_ID, from).await.unwrap();
    assert_eq!(snapshot.in_flight, vec![6]);
    assert!(snapshot.recyclable.is_empty());
}

#[tokio::test]
async fn rejected_replacement_leaves_transaction_sent() {
    let relay = relay(2, 5);
    let from = wallet(0x24);
    sent_record(&relay, "tx-cr", from, 2, vec![hash(0x32)], 100).await;
    relay
        .chain
        .fail_next_broadcast(rpc_error(TEST_CHAIN_ID, "nonce too low"));

    let err = relay.cancellation().cancel("tx-cr").await.unwrap_err();

    assert!(matches!(err, CancelError::CannotBeCancelled { .. }));
    assert_eq!(err.to_string(), "Transaction cannot be cancelled.");
    let record = relay.record("tx-cr");
    assert_eq!(record.status, TransactionStatus::Sent);
    assert_eq!(record.sent_transaction_hashes, vec![hash(0x32)]);
    assert!(relay.usage.events().is_empty());
}

#[tokio::test]
async fn mined_transaction_cannot_be_cancelled() {
    let relay = relay(2, 5);
    sent_record(&relay, "tx-cm", wallet(0x25), 0, vec![hash(0x33)], 100).await;
    relay.chain.mine(hash(0x33), true);
    run_mine(&relay, "tx-cm", 1).await.unwrap();

    let err = relay.cancellation().cancel("tx-cm").await.unwrap_err();

    assert!(matches!(err, CancelError::CannotBeCancelled { .. }));
    assert_eq!(relay.record("tx-cm").status, TransactionStatus::Mined);
    assert!(relay.signer.signed().is_empty());
}

#[tokio::test]
async fn unknown_transaction_is_not_found() {
    let relay = relay(2, 5);

    let err = relay.cancellation().cancel("missing").await.unwrap_err();

    assert!(matches!(err, CancelError::NotFound { .. }));
    assert_eq!(err.to_string(), "Transaction not found.");
}

#[tokio::test]
async fn queued_transaction_with_claimed_nonce_is_replaced() {
    let relay = relay(2, 5);
    let from = wallet(0x27);
    let claimed = claimed_record(&relay, "tx-cc", from, 8).await;

    let response = relay.cancellation().cancel("tx-cc").await.unwrap();

    let replacement = relay.signer.signed().pop().unwrap();
    assert_eq!(alloy::consensus::Transaction::nonce(&replacement), 8);
    assert_eq!(alloy::consensus::Transaction::gas_limit(&replacement), CANCELLATION_GAS_LIMIT);
    let (max_fee, _) = fees_of(&replacement);
    assert!(max_fee > claimed.sent_gas.unwrap().max_fee_per_gas);

    let record = relay.record("tx-cc");
    assert_eq!(record.status, TransactionStatus::Cancelled);
    assert_eq!(record.nonce, Some(8));
    assert_eq!(record.sent_transaction_hashes.len(), 1);
    assert_eq!(response.transaction_hash, record.last_sent_hash());
    assert_eq!(relay.chain.broadcasts(), record.sent_transaction_hashes);
    assert_eq!(relay.jobs.removal_attempts().len(), 3);

    let snapshot = relay.ledger.snapshot(TEST_CHAIN_ID, from).await.unwrap();
    assert_eq!(snapshot.in_flight, vec![8]);

    // a late delivery of the send job signs nothing
    let outcome = run_send(&relay, "tx-cc", 0, 3).await.unwrap();
    assert!(matches!(outcome, relay_executors::send::SendOutcome::Skipped { .. }));
    assert_eq!(relay.signer.signed().len(), 1);
}
