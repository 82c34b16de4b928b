//! In-memory queue and ledger for tests and single-process runs.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use vdq_models::{FetchJob, Fingerprint, MessageId};

use crate::consumer::DeliverySource;
use crate::error::{QueueError, QueueResult};
use crate::ledger::RetryLedger;
use crate::queue::{decode_job, Delivery, JobPublisher, QueueConfig};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Entry {
    message_id: MessageId,
    payload: String,
}

struct InFlight {
    message_id: MessageId,
    job: FetchJob,
    consumer: String,
    delivery_count: u64,
    last_touched: Instant,
}

/// FIFO queue with a pending list, recording every publish and ack.
///
/// Follows the Redis consumer-group protocol: a read moves a message to the
/// pending list, where it stays until acked or claimed after sitting idle.
pub struct MemoryQueue {
    ready: Mutex<VecDeque<Entry>>,
    in_flight: Mutex<Vec<InFlight>>,
    published: Mutex<Vec<(MessageId, FetchJob)>>,
    acked: Mutex<Vec<MessageId>>,
    arrivals: Notify,
    seq: AtomicU64,
    fail_next: AtomicU32,
    fail_reads: AtomicU32,
    reconnects: AtomicU32,
    read_timeout: Duration,
    claim_min_idle: Duration,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::from_config(&QueueConfig::default())
    }

    /// Use the read timeout and claim threshold of `config`.
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            ready: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            acked: Mutex::new(Vec::new()),
            arrivals: Notify::new(),
            seq: AtomicU64::new(0),
            fail_next: AtomicU32::new(0),
            fail_reads: AtomicU32::new(0),
            reconnects: AtomicU32::new(0),
            read_timeout: config.block,
            claim_min_idle: config.claim_min_idle,
        }
    }

    /// Make the next `n` publishes fail.
    pub fn fail_next_publishes(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` reads fail as if the broker went away.
    pub fn fail_next_reads(&self, n: u32) {
        self.fail_reads.store(n, Ordering::SeqCst);
    }

    /// Enqueue a raw payload without validating it.
    pub fn push_raw(&self, payload: impl Into<String>) -> MessageId {
        let message_id = self.next_id();
        lock(&self.ready).push_back(Entry {
            message_id: message_id.clone(),
            payload: payload.into(),
        });
        self.arrivals.notify_one();
        message_id
    }

    /// Take the oldest undelivered message, bypassing the pending list.
    pub fn pop(&self) -> Option<Delivery> {
        let mut ready = lock(&self.ready);
        while let Some(entry) = ready.pop_front() {
            if let Ok(job) = decode_job(&entry.payload) {
                return Some(Delivery {
                    message_id: entry.message_id,
                    job,
                    delivery_count: 1,
                });
            }
        }
        None
    }

    /// Every successful publish, in order.
    pub fn published(&self) -> Vec<(MessageId, FetchJob)> {
        lock(&self.published).clone()
    }

    /// Every acknowledged message, in order.
    pub fn acked(&self) -> Vec<MessageId> {
        lock(&self.acked).clone()
    }

    /// Delivered but not yet acknowledged.
    pub fn in_flight(&self) -> Vec<MessageId> {
        lock(&self.in_flight)
            .iter()
            .map(|d| d.message_id.clone())
            .collect()
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects.load(Ordering::SeqCst)
    }

    /// Messages not yet delivered.
    pub fn len(&self) -> usize {
        lock(&self.ready).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_id(&self) -> MessageId {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        MessageId::from_string(format!("{}-0", seq))
    }

    fn take_ready(&self) -> Option<Entry> {
        lock(&self.ready).pop_front()
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl JobPublisher for MemoryQueue {
    async fn publish(&self, mut job: FetchJob) -> QueueResult<MessageId> {
        if take_one(&self.fail_next) {
            return Err(QueueError::publish_failed("injected failure"));
        }

        job.enqueued_at = Utc::now();
        let payload = serde_json::to_string(&job)?;
        let message_id = self.next_id();

        lock(&self.published).push((message_id.clone(), job));
        lock(&self.ready).push_back(Entry {
            message_id: message_id.clone(),
            payload,
        });
        self.arrivals.notify_one();

        Ok(message_id)
    }
}

#[async_trait]
impl DeliverySource for MemoryQueue {
    async fn read_next(&self, consumer_name: &str) -> QueueResult<Option<Delivery>> {
        if take_one(&self.fail_reads) {
            return Err(QueueError::connection_failed("injected failure"));
        }

        let entry = match self.take_ready() {
            Some(entry) => entry,
            None => {
                let _ = tokio::time::timeout(self.read_timeout, self.arrivals.notified()).await;
                match self.take_ready() {
                    Some(entry) => entry,
                    None => return Ok(None),
                }
            }
        };

        match decode_job(&entry.payload) {
            Ok(job) => {
                lock(&self.in_flight).push(InFlight {
                    message_id: entry.message_id.clone(),
                    job: job.clone(),
                    consumer: consumer_name.to_string(),
                    delivery_count: 1,
                    last_touched: Instant::now(),
                });
                Ok(Some(Delivery {
                    message_id: entry.message_id,
                    job,
                    delivery_count: 1,
                }))
            }
            Err(e) => {
                warn!(message_id = %entry.message_id, "Discarding malformed job payload: {}", e);
                lock(&self.acked).push(entry.message_id);
                Ok(None)
            }
        }
    }

    async fn claim_stale(&self, consumer_name: &str) -> QueueResult<Option<Delivery>> {
        let now = Instant::now();
        let mut in_flight = lock(&self.in_flight);
        let Some(stale) = in_flight
            .iter_mut()
            .find(|d| now.duration_since(d.last_touched) >= self.claim_min_idle)
        else {
            return Ok(None);
        };

        debug!(
            message_id = %stale.message_id,
            previous_owner = %stale.consumer,
            "Claimed abandoned delivery"
        );
        stale.consumer = consumer_name.to_string();
        stale.delivery_count += 1;
        stale.last_touched = now;

        Ok(Some(Delivery {
            message_id: stale.message_id.clone(),
            job: stale.job.clone(),
            delivery_count: stale.delivery_count,
        }))
    }

    async fn touch(&self, consumer_name: &str, message_id: &MessageId) -> QueueResult<()> {
        let now = Instant::now();
        if let Some(d) = lock(&self.in_flight)
            .iter_mut()
            .find(|d| &d.message_id == message_id)
        {
            d.consumer = consumer_name.to_string();
            d.last_touched = now;
        }
        Ok(())
    }

    async fn ack(&self, message_id: &MessageId) -> QueueResult<()> {
        lock(&self.in_flight).retain(|d| &d.message_id != message_id);
        lock(&self.acked).push(message_id.clone());
        Ok(())
    }

    async fn reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
    }
}

/// Ledger with per-key expiry on the tokio clock.
pub struct MemoryRetryLedger {
    ttl: Duration,
    entries: Mutex<HashMap<Fingerprint, (u64, Instant)>>,
    fail: AtomicU32,
}

impl MemoryRetryLedger {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
            fail: AtomicU32::new(0),
        }
    }

    /// Make the next `n` calls fail.
    pub fn fail_next_calls(&self, n: u32) {
        self.fail.store(n, Ordering::SeqCst);
    }

    fn check_failure(&self) -> QueueResult<()> {
        if take_one(&self.fail) {
            Err(QueueError::connection_failed("injected failure"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RetryLedger for MemoryRetryLedger {
    async fn get(&self, fingerprint: &Fingerprint) -> QueueResult<u64> {
        self.check_failure()?;
        let now = Instant::now();
        Ok(lock(&self.entries)
            .get(fingerprint)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(count, _)| *count)
            .unwrap_or(0))
    }

    async fn increment(&self, fingerprint: &Fingerprint) -> QueueResult<u64> {
        self.check_failure()?;
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        let entry = entries.entry(fingerprint.clone()).or_insert((0, now));
        if entry.1 <= now {
            entry.0 = 0;
        }
        entry.0 += 1;
        entry.1 = now + self.ttl;
        Ok(entry.0)
    }

    async fn reset(&self, fingerprint: &Fingerprint) -> QueueResult<()> {
        self.check_failure()?;
        lock(&self.entries).remove(fingerprint);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_assigns_fresh_ids() {
        let queue = MemoryQueue::new();
        let job = FetchJob::new("https://x/a");

        let first = queue.publish(job.clone()).await.unwrap();
        let second = queue.publish(job.next_attempt()).await.unwrap();

        assert_ne!(first, second);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().message_id, first);
    }

    #[tokio::test]
    async fn test_read_moves_message_to_pending_until_ack() {
        let queue = MemoryQueue::new();
        let id = queue.publish(FetchJob::new("https://x/a")).await.unwrap();

        let delivery = queue.read_next("c1").await.unwrap().unwrap();
        assert_eq!(delivery.message_id, id);
        assert_eq!(queue.in_flight(), vec![id.clone()]);

        queue.ack(&id).await.unwrap();
        assert!(queue.in_flight().is_empty());
        assert_eq!(queue.acked(), vec![id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_respects_idle_time_and_touch() {
        let queue = MemoryQueue::new();
        queue.publish(FetchJob::new("https://x/a")).await.unwrap();
        let delivery = queue.read_next("c1").await.unwrap().unwrap();

        tokio::time::advance(Duration::from_secs(200)).await;
        queue.touch("c1", &delivery.message_id).await.unwrap();
        tokio::time::advance(Duration::from_secs(200)).await;
        assert!(queue.claim_stale("c2").await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(100)).await;
        let claimed = queue.claim_stale("c2").await.unwrap().unwrap();
        assert_eq!(claimed.message_id, delivery.message_id);
        assert_eq!(claimed.delivery_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_payload_is_acked_on_read() {
        let queue = MemoryQueue::new();
        let bad = queue.push_raw("{\"attempt\":\"x\"}");

        assert!(queue.read_next("c1").await.unwrap().is_none());
        assert_eq!(queue.acked(), vec![bad]);
        assert!(queue.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_injected_publish_failure() {
        let queue = MemoryQueue::new();
        queue.fail_next_publishes(1);

        tokio_test::assert_err!(queue.publish(FetchJob::new("k")).await);
        tokio_test::assert_ok!(queue.publish(FetchJob::new("k")).await);
        assert_eq!(queue.published().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ledger_counts_and_expires() {
        let ledger = MemoryRetryLedger::new(Duration::from_secs(60));
        let fp = Fingerprint::of("https://x/a");

        assert_eq!(ledger.get(&fp).await.unwrap(), 0);
        assert_eq!(ledger.increment(&fp).await.unwrap(), 1);
        assert_eq!(ledger.increment(&fp).await.unwrap(), 2);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(ledger.get(&fp).await.unwrap(), 2);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(ledger.get(&fp).await.unwrap(), 0);
        assert_eq!(ledger.increment(&fp).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ledger_increment_refreshes_expiry() {
        let ledger = MemoryRetryLedger::new(Duration::from_secs(60));
        let fp = Fingerprint::of("https://x/a");

        ledger.increment(&fp).await.unwrap();
        tokio::time::advance(Duration::from_secs(50)).await;
        ledger.increment(&fp).await.unwrap();
        tokio::time::advance(Duration::from_secs(50)).await;

        assert_eq!(ledger.get(&fp).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_ledger_reset() {
        let ledger = MemoryRetryLedger::new(Duration::from_secs(60));
        let fp = Fingerprint::of("k");

        ledger.increment(&fp).await.unwrap();
        ledger.reset(&fp).await.unwrap();
        assert_eq!(ledger.get(&fp).await.unwrap(), 0);
    }
}
