//! Artifact store seam and an in-memory implementation.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use vdq_models::Artifact;

use crate::error::{StorageError, StorageResult};

/// Object storage operations the pipeline needs.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Upload a local file under `key`, overwriting any existing object.
    /// `download_name` becomes the attachment file name when set.
    async fn put(&self, key: &str, local_path: &Path, download_name: Option<&str>)
        -> StorageResult<()>;

    /// All objects whose key starts with `prefix`. An empty prefix lists everything.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<Artifact>>;

    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Time-limited GET URL for an object.
    async fn presign(&self, key: &str, expires_in: Duration) -> StorageResult<String>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// In-memory store with failure injection.
#[derive(Default)]
pub struct MemoryArtifactStore {
    objects: Mutex<BTreeMap<String, Artifact>>,
    download_names: Mutex<BTreeMap<String, String>>,
    puts: AtomicU32,
    fail_puts: AtomicU32,
    fail_lists: AtomicU32,
    failing_deletes: Mutex<HashSet<String>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object directly.
    pub fn insert(&self, artifact: Artifact) {
        lock(&self.objects).insert(artifact.key.clone(), artifact);
    }

    pub fn get(&self, key: &str) -> Option<Artifact> {
        lock(&self.objects).get(key).cloned()
    }

    pub fn download_name(&self, key: &str) -> Option<String> {
        lock(&self.download_names).get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        lock(&self.objects).keys().cloned().collect()
    }

    /// Number of successful uploads so far.
    pub fn put_count(&self) -> u32 {
        self.puts.load(Ordering::SeqCst)
    }

    /// Make the next `n` uploads fail.
    pub fn fail_next_puts(&self, n: u32) {
        self.fail_puts.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` listings fail.
    pub fn fail_next_lists(&self, n: u32) {
        self.fail_lists.store(n, Ordering::SeqCst);
    }

    /// Make every delete of `key` fail.
    pub fn fail_deletes_of(&self, key: impl Into<String>) {
        lock(&self.failing_deletes).insert(key.into());
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(
        &self,
        key: &str,
        local_path: &Path,
        download_name: Option<&str>,
    ) -> StorageResult<()> {
        if take_failure(&self.fail_puts) {
            return Err(StorageError::upload_failed("injected failure"));
        }

        let size = tokio::fs::metadata(local_path).await?.len();
        lock(&self.objects).insert(key.to_string(), Artifact::new(key, size, Utc::now()));
        if let Some(name) = download_name {
            lock(&self.download_names).insert(key.to_string(), name.to_string());
        }
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<Artifact>> {
        if take_failure(&self.fail_lists) {
            return Err(StorageError::list_failed("injected failure"));
        }

        Ok(lock(&self.objects)
            .values()
            .filter(|a| a.key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        if lock(&self.failing_deletes).contains(key) {
            return Err(StorageError::delete_failed(format!("injected failure for {}", key)));
        }
        lock(&self.objects).remove(key);
        lock(&self.download_names).remove(key);
        Ok(())
    }

    async fn presign(&self, key: &str, expires_in: Duration) -> StorageResult<String> {
        Ok(format!("memory://{}?expires={}", key, expires_in.as_secs()))
    }
}
