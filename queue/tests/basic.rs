
use std::sync::{Arc, atomic::Ordering};
use std::time::Duration;

use fixtures::*;
use redis::AsyncCommands;
use relay_queue::{
    Queue,
    job::{DelayOptions, JobOptions, JobStatus, PushOutcome},
};

fn payload(message: &str) -> TestJobPayload {
    TestJobPayload {
        message: message.to_string(),
        succeed_on_attempt: 1,
        max_attempts: 1,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires a local redis at 127.0.0.1:6379"]
async fn push_and_process_job() {
    setup_tracing();
    let queue_name = format!("test_basic_{}", nanoid::nanoid!(6));
    let observed = Arc::new(Observed::default());

    let queue = Queue::builder()
        .redis_url(REDIS_URL)
        .name(&queue_name)
        .options(fast_options())
        .handler(TestJobHandler::new(observed.clone()))
        .build()
        .await
        .expect("queue builds")
        .arc();
    cleanup_redis_keys(&queue.handle().redis, &queue_name).await;

    let outcome = queue
        .handle()
        .push(JobOptions::new(payload("hello")).with_id("job_1"))
        .await
        .expect("push succeeds");
    assert_eq!(outcome, PushOutcome::Queued);
    assert_eq!(queue.handle().count(JobStatus::Pending).await.unwrap(), 1);

    let worker = queue.work();
    let done = wait_until(Duration::from_secs(5), || {
        observed.succeeded.load(Ordering::SeqCst) == 1
    })
    .await;
    assert!(done, "job should succeed");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(queue.handle().count(JobStatus::Success).await.unwrap(), 1);
    assert_eq!(queue.handle().count(JobStatus::Pending).await.unwrap(), 0);
    assert_eq!(queue.handle().count(JobStatus::Active).await.unwrap(), 0);

    let mut conn = queue.handle().redis.clone();
    let result: Option<String> = conn
        .hget(queue.handle().job_result_hash_name(), "job_1")
        .await
        .unwrap();
    assert!(result.unwrap().contains("processed 'hello'"));

    worker.shutdown().await.unwrap();
    cleanup_redis_keys(&queue.handle().redis, &queue_name).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires a local redis at 127.0.0.1:6379"]
async fn duplicate_ids_are_skipped() {
    setup_tracing();
    let queue_name = format!("test_dedupe_{}", nanoid::nanoid!(6));
    let observed = Arc::new(Observed::default());

    let queue = Queue::builder()
        .redis_url(REDIS_URL)
        .name(&queue_name)
        .options(fast_options())
        .handler(TestJobHandler::new(observed.clone()))
        .build()
        .await
        .unwrap()
        .arc();
    cleanup_redis_keys(&queue.handle().redis, &queue_name).await;

    let first = queue.handle().job(payload("a")).with_id("same").push().await.unwrap();
    let second = queue.handle().job(payload("b")).with_id("same").push().await.unwrap();

    assert_eq!(first, PushOutcome::Queued);
    assert_eq!(second, PushOutcome::Duplicate);
    assert_eq!(queue.handle().count(JobStatus::Pending).await.unwrap(), 1);

    let stored = queue.handle().get_job("same").await.unwrap().unwrap();
    assert_eq!(stored.data.message, "a");
    assert_eq!(stored.attempts, 0);

    cleanup_redis_keys(&queue.handle().redis, &queue_name).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires a local redis at 127.0.0.1:6379"]
async fn delayed_job_runs_after_delay() {
    setup_tracing();
    let queue_name = format!("test_delay_{}", nanoid::nanoid!(6));
    let observed = Arc::new(Observed::default());

    let queue = Queue::builder()
        .redis_url(REDIS_URL)
        .name(&queue_name)
        .options(fast_options())
        .handler(TestJobHandler::new(observed.clone()))
        .build()
        .await
        .unwrap()
        .arc();
    cleanup_redis_keys(&queue.handle().redis, &queue_name).await;

    queue
        .handle()
        .job(payload("later"))
        .with_delay(DelayOptions::last(Duration::from_millis(500)))
        .push()
        .await
        .unwrap();
    assert_eq!(queue.handle().count(JobStatus::Delayed).await.unwrap(), 1);

    let worker = queue.work();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(observed.processed.load(Ordering::SeqCst), 0);

    let done = wait_until(Duration::from_secs(5), || {
        observed.succeeded.load(Ordering::SeqCst) == 1
    })
    .await;
    assert!(done, "delayed job should eventually run");

    worker.shutdown().await.unwrap();
    cleanup_redis_keys(&queue.handle().redis, &queue_name).await;
}
