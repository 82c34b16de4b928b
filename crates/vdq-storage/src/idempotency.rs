//! Dedup lookups against the artifact store.

use std::sync::Arc;

use tracing::debug;

use vdq_models::{Artifact, Fingerprint};

use crate::error::StorageResult;
use crate::store::ArtifactStore;

/// Smallest object accepted as a finished artifact (1 MiB).
pub const DEFAULT_MIN_VALID_SIZE: u64 = 1024 * 1024;

/// Answers "is there already a valid artifact for this fingerprint?".
///
/// Objects below the size threshold are leftovers of interrupted uploads
/// and count as absent.
#[derive(Clone)]
pub struct IdempotencyStore {
    store: Arc<dyn ArtifactStore>,
    min_valid_size: u64,
}

impl IdempotencyStore {
    pub fn new(store: Arc<dyn ArtifactStore>, min_valid_size: u64) -> Self {
        Self {
            store,
            min_valid_size,
        }
    }

    pub fn min_valid_size(&self) -> u64 {
        self.min_valid_size
    }

    /// The largest valid artifact stored under the fingerprint, if any.
    pub async fn find_valid(&self, fingerprint: &Fingerprint) -> StorageResult<Option<Artifact>> {
        let listed = self.store.list(fingerprint.as_str()).await?;
        let total = listed.len();

        let found = listed
            .into_iter()
            .filter(|a| a.is_valid(self.min_valid_size))
            .max_by_key(|a| a.size);

        debug!(
            fingerprint = %fingerprint,
            listed = total,
            valid = found.is_some(),
            "Dedup lookup"
        );
        Ok(found)
    }

    pub async fn exists_valid(&self, fingerprint: &Fingerprint) -> StorageResult<bool> {
        Ok(self.find_valid(fingerprint).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryArtifactStore;
    use chrono::Utc;
    use vdq_models::artifact_key;

    const MB: u64 = DEFAULT_MIN_VALID_SIZE;

    fn setup(size: u64) -> (IdempotencyStore, Fingerprint) {
        let store = Arc::new(MemoryArtifactStore::new());
        let fp = Fingerprint::of("https://x/a");
        store.insert(Artifact::new(artifact_key(&fp, Some("mp4")), size, Utc::now()));
        (IdempotencyStore::new(store, MB), fp)
    }

    #[tokio::test]
    async fn test_just_below_threshold_is_absent() {
        let (dedup, fp) = setup(MB - 1);
        assert!(!dedup.exists_valid(&fp).await.unwrap());
    }

    #[tokio::test]
    async fn test_exact_threshold_is_present() {
        let (dedup, fp) = setup(MB);
        assert!(dedup.exists_valid(&fp).await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_byte_leftover_is_absent() {
        let (dedup, fp) = setup(0);
        assert_eq!(dedup.find_valid(&fp).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_other_fingerprints_do_not_match() {
        let (dedup, _) = setup(MB * 10);
        let other = Fingerprint::of("https://x/b");
        assert!(!dedup.exists_valid(&other).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_failure_propagates() {
        let store = Arc::new(MemoryArtifactStore::new());
        store.fail_next_lists(1);
        let dedup = IdempotencyStore::new(store, MB);

        tokio_test::assert_err!(dedup.exists_valid(&Fingerprint::of("k")).await);
    }
}
