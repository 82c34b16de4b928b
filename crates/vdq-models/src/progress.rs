//! Progress relay message types.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Status reported by the extraction engine alongside byte counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Downloading,
    Finished,
}

/// Raw progress tick from the extraction adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DownloadProgress {
    /// Bytes downloaded so far
    pub downloaded: u64,
    /// Total size, when the engine knows it
    pub total: Option<u64>,
    pub status: DownloadStatus,
}

impl DownloadProgress {
    pub fn downloading(downloaded: u64, total: Option<u64>) -> Self {
        Self {
            downloaded,
            total,
            status: DownloadStatus::Downloading,
        }
    }

    pub fn finished() -> Self {
        Self {
            downloaded: 0,
            total: None,
            status: DownloadStatus::Finished,
        }
    }

    /// Percentage complete, if the total size is known.
    pub fn percent(&self) -> Option<f64> {
        match self.total {
            Some(total) if total > 0 => {
                Some(((self.downloaded as f64 / total as f64) * 100.0).clamp(0.0, 100.0))
            }
            _ => None,
        }
    }
}

/// Message delivered to a progress subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressMessage {
    /// Download progress (0-100)
    Downloading { percent: f64 },

    /// Extraction finished
    Finished,

    /// Artifact is stored and available
    Completed {
        object_key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        download_url: Option<String>,
    },

    /// Job gave up for good
    Failed { message: String },
}

impl ProgressMessage {
    /// Map an adapter tick to a relay message.
    ///
    /// Ticks with an unknown total produce nothing; only `finished` is
    /// reported for those downloads.
    pub fn from_progress(progress: &DownloadProgress) -> Option<Self> {
        match progress.status {
            DownloadStatus::Finished => Some(Self::Finished),
            DownloadStatus::Downloading => progress
                .percent()
                .map(|percent| Self::Downloading { percent }),
        }
    }

    pub fn completed(object_key: impl Into<String>, download_url: Option<String>) -> Self {
        Self::Completed {
            object_key: object_key.into(),
            download_url,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

/// A message addressed to one client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProgressEvent {
    pub client_ref: String,
    pub message: ProgressMessage,
}
