//! Retention sweeper.
//!
//! Deletes artifacts older than the retention TTL on a fixed interval,
//! independently of job processing.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use vdq_models::Artifact;
use vdq_queue::MIN_TIMER_PERIOD;
use vdq_storage::{ArtifactStore, StorageResult};

use crate::metrics;
use crate::retry::FailureTracker;

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub deleted: usize,
    pub failed: usize,
}

/// Periodic deletion of expired artifacts.
pub struct RetentionSweeper {
    store: Arc<dyn ArtifactStore>,
    ttl: Duration,
    interval: Duration,
}

impl RetentionSweeper {
    /// Intervals under [`MIN_TIMER_PERIOD`] are raised to it.
    pub fn new(store: Arc<dyn ArtifactStore>, ttl: Duration, interval: Duration) -> Self {
        Self {
            store,
            ttl,
            interval: interval.max(MIN_TIMER_PERIOD),
        }
    }

    /// Whether `artifact` is past its retention at `now`.
    pub fn is_expired(&self, artifact: &Artifact, now: DateTime<Utc>) -> bool {
        artifact
            .age(now)
            .to_std()
            .map(|age| age > self.ttl)
            .unwrap_or(false)
    }

    /// One pass over the store.
    ///
    /// Only a failed listing is an error. Each delete is attempted on its
    /// own; failures are logged and counted.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> StorageResult<SweepReport> {
        let artifacts = self.store.list("").await?;
        let mut report = SweepReport {
            scanned: artifacts.len(),
            ..SweepReport::default()
        };

        for artifact in artifacts.iter().filter(|a| self.is_expired(a, now)) {
            match self.store.delete(&artifact.key).await {
                Ok(()) => {
                    report.deleted += 1;
                    debug!(
                        key = %artifact.key,
                        age_secs = artifact.age(now).num_seconds(),
                        "Deleted expired artifact"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(key = %artifact.key, "Failed to delete expired artifact: {}", e);
                }
            }
        }

        metrics::record_sweep(report.deleted, report.failed);
        Ok(report)
    }

    /// Sweep every interval until `shutdown` turns true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting retention sweeper (ttl: {:?}, interval: {:?})",
            self.ttl, self.interval
        );

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = FailureTracker::new(3);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.sweep_once(Utc::now()).await {
                        Ok(report) => {
                            failures.record_success();
                            info!(
                                scanned = report.scanned,
                                deleted = report.deleted,
                                failed = report.failed,
                                "Retention sweep finished"
                            );
                        }
                        Err(e) => {
                            if failures.record_failure() {
                                error!("Retention sweep failed: {}", e);
                            }
                        }
                    }
                }
            }
        }

        info!("Retention sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use vdq_storage::MemoryArtifactStore;

    const TTL: Duration = Duration::from_secs(7200);

    fn reference_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn aged(key: &str, age_secs: i64) -> Artifact {
        Artifact::new(
            key,
            2 * 1024 * 1024,
            reference_now() - chrono::Duration::seconds(age_secs),
        )
    }

    fn setup() -> (Arc<MemoryArtifactStore>, RetentionSweeper) {
        let store = Arc::new(MemoryArtifactStore::new());
        let sweeper = RetentionSweeper::new(store.clone(), TTL, Duration::from_secs(3600));
        (store, sweeper)
    }

    #[tokio::test]
    async fn test_ttl_boundary() {
        let (store, sweeper) = setup();
        store.insert(aged("old.mp4", 7201));
        store.insert(aged("young.mp4", 7199));

        let report = sweeper.sweep_once(reference_now()).await.unwrap();

        assert_eq!(report, SweepReport { scanned: 2, deleted: 1, failed: 0 });
        assert!(store.get("old.mp4").is_none());
        assert!(store.get("young.mp4").is_some());
    }

    #[tokio::test]
    async fn test_exact_ttl_is_kept() {
        let (store, sweeper) = setup();
        store.insert(aged("edge.mp4", 7200));

        sweeper.sweep_once(reference_now()).await.unwrap();
        assert!(store.get("edge.mp4").is_some());
    }

    #[tokio::test]
    async fn test_failed_delete_does_not_abort_sweep() {
        let (store, sweeper) = setup();
        store.insert(aged("a.mp4", 9000));
        store.insert(aged("b.mp4", 9000));
        store.insert(aged("c.mp4", 9000));
        store.fail_deletes_of("b.mp4");

        let report = sweeper.sweep_once(reference_now()).await.unwrap();

        assert_eq!(report.deleted, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(store.keys(), vec!["b.mp4".to_string()]);
    }

    #[tokio::test]
    async fn test_invalid_leftovers_are_swept_too() {
        let (store, sweeper) = setup();
        store.insert(Artifact::new(
            "partial.mp4",
            0,
            reference_now() - chrono::Duration::hours(3),
        ));

        let report = sweeper.sweep_once(reference_now()).await.unwrap();
        assert_eq!(report.deleted, 1);
    }

    #[tokio::test]
    async fn test_list_failure_is_reported() {
        let (store, sweeper) = setup();
        store.fail_next_lists(1);

        tokio_test::assert_err!(sweeper.sweep_once(reference_now()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_is_raised() {
        let store = Arc::new(MemoryArtifactStore::new());
        store.insert(Artifact::new(
            "stale.mp4",
            2 * 1024 * 1024,
            Utc::now() - chrono::Duration::hours(3),
        ));
        let sweeper = RetentionSweeper::new(store.clone(), TTL, Duration::ZERO);
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(async move { sweeper.run(rx).await });
        tokio::time::sleep(Duration::from_millis(1500)).await;
        tx.send(true).unwrap();

        task.await.unwrap();
        assert!(store.get("stale.mp4").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let (_store, sweeper) = setup();
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(async move { sweeper.run(rx).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();

        task.await.unwrap();
    }
}
