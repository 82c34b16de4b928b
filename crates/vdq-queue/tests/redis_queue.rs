//! Redis integration tests.

use std::time::Duration;

use vdq_models::{FetchJob, Fingerprint};
use vdq_queue::{JobPublisher, JobQueue, QueueConfig, RedisRetryLedger, RetryLedger};

fn test_config() -> QueueConfig {
    dotenvy::dotenv().ok();
    let mut config = QueueConfig::from_env();
    config.stream_name = format!("vdq:test:{}", uuid::Uuid::new_v4());
    config.block = Duration::from_millis(200);
    config
}

/// Publish, consume and acknowledge one job.
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_publish_consume_ack() {
    let queue = JobQueue::new(test_config()).expect("Failed to create queue");
    queue.connect().await;

    let job = FetchJob::new("https://www.youtube.com/watch?v=test").with_client_ref("client-1");
    let message_id = queue.publish(job.clone()).await.expect("Failed to publish");

    let delivery = queue
        .read_next("test-consumer")
        .await
        .expect("Failed to read")
        .expect("No delivery");

    assert_eq!(delivery.message_id, message_id);
    assert_eq!(delivery.job.key, job.key);
    assert_eq!(delivery.job.client_ref.as_deref(), Some("client-1"));
    assert_eq!(delivery.delivery_count, 1);

    queue.ack(&delivery.message_id).await.expect("Failed to ack");
    assert_eq!(queue.len().await.expect("Failed to get length"), 0);
    queue.close().await;
}

/// An unacknowledged delivery is claimed by another consumer once idle.
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_abandoned_delivery_is_claimed() {
    let mut config = test_config();
    config.claim_min_idle = Duration::from_millis(100);
    let queue = JobQueue::new(config).expect("Failed to create queue");
    queue.connect().await;

    queue
        .publish(FetchJob::new("https://x/abandoned"))
        .await
        .expect("Failed to publish");

    let first = queue.read_next("crashed").await.unwrap().expect("No delivery");
    tokio::time::sleep(Duration::from_millis(300)).await;

    let claimed = queue
        .claim_stale("survivor")
        .await
        .unwrap()
        .expect("Nothing claimed");
    assert_eq!(claimed.message_id, first.message_id);
    assert_eq!(claimed.delivery_count, 2);

    queue.ack(&claimed.message_id).await.unwrap();
    queue.close().await;
}

/// A touched delivery is not claimable.
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_touch_keeps_delivery() {
    let mut config = test_config();
    config.claim_min_idle = Duration::from_millis(500);
    let queue = JobQueue::new(config).expect("Failed to create queue");
    queue.connect().await;

    queue.publish(FetchJob::new("https://x/busy")).await.unwrap();
    let delivery = queue.read_next("busy").await.unwrap().expect("No delivery");

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(250)).await;
        queue.touch("busy", &delivery.message_id).await.unwrap();
    }

    assert!(queue.claim_stale("thief").await.unwrap().is_none());
    queue.ack(&delivery.message_id).await.unwrap();
    queue.close().await;
}

/// An abandoned delivery is found even when older entries are held by busy consumers.
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_claim_finds_abandoned_delivery_behind_busy_ones() {
    let mut config = test_config();
    config.claim_min_idle = Duration::from_millis(500);
    let queue = JobQueue::new(config).expect("Failed to create queue");
    queue.connect().await;

    for i in 0..12 {
        queue
            .publish(FetchJob::new(format!("https://x/{}", i)))
            .await
            .unwrap();
    }

    let mut busy = Vec::new();
    for i in 0..11 {
        let consumer = format!("busy-{}", i);
        let delivery = queue.read_next(&consumer).await.unwrap().expect("No delivery");
        busy.push((consumer, delivery.message_id));
    }
    let abandoned = queue.read_next("crashed").await.unwrap().expect("No delivery");

    for _ in 0..2 {
        tokio::time::sleep(Duration::from_millis(300)).await;
        for (consumer, message_id) in &busy {
            queue.touch(consumer, message_id).await.unwrap();
        }
    }

    let claimed = queue
        .claim_stale("survivor")
        .await
        .unwrap()
        .expect("Nothing claimed");
    assert_eq!(claimed.message_id, abandoned.message_id);
    queue.close().await;
}

/// A payload that is not a job is acknowledged and removed.
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_malformed_payload_is_discarded() {
    let config = test_config();
    let queue = JobQueue::new(config.clone()).expect("Failed to create queue");
    queue.connect().await;

    let client = redis::Client::open(config.redis_url.as_str()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let _: String = redis::cmd("XADD")
        .arg(&config.stream_name)
        .arg("*")
        .arg("job")
        .arg("not json")
        .query_async(&mut conn)
        .await
        .unwrap();

    assert!(queue.read_next("test-consumer").await.unwrap().is_none());
    assert_eq!(queue.len().await.unwrap(), 0);

    let pending: redis::streams::StreamPendingReply = redis::cmd("XPENDING")
        .arg(&config.stream_name)
        .arg(&config.consumer_group)
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(pending.count(), 0);
    queue.close().await;
}

/// Ledger increments atomically and carries an expiry.
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_ledger_roundtrip() {
    let config = test_config();
    let ledger = RedisRetryLedger::new(&config.redis_url, Duration::from_secs(60))
        .expect("Failed to create ledger");
    let fp = Fingerprint::of(&format!("https://x/{}", uuid::Uuid::new_v4()));

    assert_eq!(ledger.get(&fp).await.unwrap(), 0);
    assert_eq!(ledger.increment(&fp).await.unwrap(), 1);
    assert_eq!(ledger.increment(&fp).await.unwrap(), 2);
    assert_eq!(ledger.get(&fp).await.unwrap(), 2);

    ledger.reset(&fp).await.unwrap();
    assert_eq!(ledger.get(&fp).await.unwrap(), 0);
}
