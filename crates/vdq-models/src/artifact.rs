//! Stored artifacts and object naming.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::utils::sanitize_object_name;
use crate::Fingerprint;

/// Extension used when the extracted file has none.
const DEFAULT_EXTENSION: &str = "mp4";

/// A stored result object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Artifact {
    /// Object key (starts with the fingerprint)
    pub key: String,
    /// Size in bytes
    pub size: u64,
    /// Last modification time reported by the store
    pub last_modified: DateTime<Utc>,
}

impl Artifact {
    pub fn new(key: impl Into<String>, size: u64, last_modified: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            size,
            last_modified,
        }
    }

    /// Whether the object is large enough to count as a finished upload.
    ///
    /// Smaller objects are leftovers of crashed uploads and are treated as absent.
    pub fn is_valid(&self, min_valid_size: u64) -> bool {
        self.size >= min_valid_size
    }

    /// Age relative to `now`. Never negative.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.last_modified).max(chrono::Duration::zero())
    }
}

/// Object key for a fingerprint. Depends only on the fingerprint and the
/// file extension, so duplicate jobs for one key overwrite the same object.
pub fn artifact_key(fingerprint: &Fingerprint, extension: Option<&str>) -> String {
    let ext = extension
        .map(|e| e.trim_start_matches('.'))
        .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or(DEFAULT_EXTENSION);
    format!("{}.{}", fingerprint, ext.to_ascii_lowercase())
}

/// Human-facing download name built from the extracted title.
pub fn download_file_name(title: &str, extension: Option<&str>) -> String {
    let ext = extension
        .map(|e| e.trim_start_matches('.'))
        .filter(|e| !e.is_empty())
        .unwrap_or(DEFAULT_EXTENSION);
    sanitize_object_name(&format!("{}.{}", title, ext))
}

/// Content type for an object key.
pub fn content_type_for(key: &str) -> &'static str {
    let lower = key.to_ascii_lowercase();
    if lower.ends_with(".mp4") {
        "video/mp4"
    } else if lower.ends_with(".webm") {
        "video/webm"
    } else {
        "application/octet-stream"
    }
}
