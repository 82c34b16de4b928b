//! Per-fingerprint retry ledger.
//!
//! Counts processing attempts for a key across all message lineages,
//! so resubmitting a URL does not reset its budget.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::debug;

use vdq_models::Fingerprint;

use crate::error::QueueResult;

/// Key prefix for ledger entries.
pub const LEDGER_KEY_PREFIX: &str = "vdq-";

/// Expiring attempt counter keyed by fingerprint.
#[async_trait]
pub trait RetryLedger: Send + Sync {
    /// Current count; 0 when absent or expired.
    async fn get(&self, fingerprint: &Fingerprint) -> QueueResult<u64>;

    /// Atomically add one, refresh the expiry and return the new count.
    async fn increment(&self, fingerprint: &Fingerprint) -> QueueResult<u64>;

    /// Forget the key.
    async fn reset(&self, fingerprint: &Fingerprint) -> QueueResult<()>;
}

/// Ledger stored in Redis as `vdq-<fingerprint>` counters.
pub struct RedisRetryLedger {
    client: redis::Client,
    ttl: Duration,
}

impl RedisRetryLedger {
    pub fn new(redis_url: &str, ttl: Duration) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client, ttl })
    }

    pub fn key(fingerprint: &Fingerprint) -> String {
        format!("{}{}", LEDGER_KEY_PREFIX, fingerprint)
    }

    fn ttl_secs(&self) -> i64 {
        self.ttl.as_secs().max(1) as i64
    }
}

#[async_trait]
impl RetryLedger for RedisRetryLedger {
    async fn get(&self, fingerprint: &Fingerprint) -> QueueResult<u64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let count: Option<u64> = conn.get(Self::key(fingerprint)).await?;
        Ok(count.unwrap_or(0))
    }

    async fn increment(&self, fingerprint: &Fingerprint) -> QueueResult<u64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = Self::key(fingerprint);

        // INCR and EXPIRE in one transaction
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .incr(&key, 1u64)
            .expire(&key, self.ttl_secs())
            .ignore()
            .query_async(&mut conn)
            .await?;

        debug!(fingerprint = %fingerprint, count, "Ledger incremented");
        Ok(count)
    }

    async fn reset(&self, fingerprint: &Fingerprint) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.del::<_, ()>(Self::key(fingerprint)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_format() {
        let fp = Fingerprint::of("abc");
        assert_eq!(
            RedisRetryLedger::key(&fp),
            "vdq-ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_zero_ttl_still_expires() {
        let ledger = RedisRetryLedger::new("redis://localhost:6379", Duration::ZERO).unwrap();
        assert_eq!(ledger.ttl_secs(), 1);
    }
}
