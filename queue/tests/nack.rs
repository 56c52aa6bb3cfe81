
use std::sync::{Arc, atomic::Ordering};
use std::time::Duration;

use fixtures::*;
use relay_queue::{
    Queue,
    job::{JobOptions, JobStatus},
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires a local redis at 127.0.0.1:6379"]
async fn nacked_job_is_retried_until_success() {
    setup_tracing();
    let queue_name = format!("test_nack_{}", nanoid::nanoid!(6));
    let observed = Arc::new(Observed::default());

    let mut handler = TestJobHandler::new(observed.clone());
    handler.nack_delay = Some(Duration::from_millis(50));

    let queue = Queue::builder()
        .redis_url(REDIS_URL)
        .name(&queue_name)
        .options(fast_options())
        .handler(handler)
        .build()
        .await
        .unwrap()
        .arc();
    cleanup_redis_keys(&queue.handle().redis, &queue_name).await;

    let payload = TestJobPayload {
        message: "retry me".to_string(),
        succeed_on_attempt: 3,
        max_attempts: 10,
    };
    queue
        .handle()
        .push(JobOptions::new(payload).with_id("retry_job"))
        .await
        .unwrap();

    let worker = queue.work();
    let done = wait_until(Duration::from_secs(10), || {
        observed.succeeded.load(Ordering::SeqCst) == 1
    })
    .await;
    assert!(done, "job should succeed on its third attempt");
    assert_eq!(observed.nacked.load(Ordering::SeqCst), 2);
    assert_eq!(observed.processed.load(Ordering::SeqCst), 3);

    let job = queue.handle().get_job("retry_job").await.unwrap().unwrap();
    assert_eq!(job.attempts, 3);

    worker.shutdown().await.unwrap();
    cleanup_redis_keys(&queue.handle().redis, &queue_name).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires a local redis at 127.0.0.1:6379"]
async fn job_fails_when_attempt_budget_is_spent() {
    setup_tracing();
    let queue_name = format!("test_nack_fail_{}", nanoid::nanoid!(6));
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

    let payload = TestJobPayload {
        message: "never".to_string(),
        succeed_on_attempt: u32::MAX,
        max_attempts: 2,
    };
    queue
        .handle()
        .push(JobOptions::new(payload).with_id("doomed"))
        .await
        .unwrap();

    let worker = queue.work();
    let done = wait_until(Duration::from_secs(5), || {
        observed.failed_ids() == vec!["doomed".to_string()]
    })
    .await;
    assert!(done, "job should fail after two attempts");
    assert_eq!(observed.nacked.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(queue.handle().count(JobStatus::Failed).await.unwrap(), 1);

    worker.shutdown().await.unwrap();
    cleanup_redis_keys(&queue.handle().redis, &queue_name).await;
}
