//! Extraction adapter seam.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use vdq_models::DownloadProgress;

use crate::error::MediaResult;

/// A fetched file waiting in its staging directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    pub local_path: PathBuf,
    /// Directory owned by this fetch; removing it releases everything
    pub staging_dir: PathBuf,
    pub title: String,
    pub size: u64,
}

impl Extracted {
    /// File extension of the fetched file, if any.
    pub fn extension(&self) -> Option<&str> {
        self.local_path.extension().and_then(|e| e.to_str())
    }

    /// Delete the staging directory.
    pub async fn cleanup(&self) {
        remove_staging(&self.staging_dir).await;
    }
}

/// Fetches remote media into a local staging directory.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Fetch `key`, reporting progress zero or more times before returning.
    ///
    /// On failure nothing is left behind on disk.
    async fn fetch(
        &self,
        key: &str,
        on_progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> MediaResult<Extracted>;
}

/// Remove a staging directory, ignoring one that is already gone.
pub async fn remove_staging(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!("Removed staging directory {}", dir.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove staging directory {}: {}", dir.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cleanup_removes_staging_dir() {
        let root = tempfile::tempdir().unwrap();
        let staging = root.path().join("abcd1234");
        tokio::fs::create_dir_all(&staging).await.unwrap();
        tokio::fs::write(staging.join("x.mp4"), b"data").await.unwrap();

        let extracted = Extracted {
            local_path: staging.join("x.mp4"),
            staging_dir: staging.clone(),
            title: "x".to_string(),
            size: 4,
        };
        assert_eq!(extracted.extension(), Some("mp4"));

        extracted.cleanup().await;
        assert!(!staging.exists());

        // Second cleanup is a no-op
        extracted.cleanup().await;
    }
}
