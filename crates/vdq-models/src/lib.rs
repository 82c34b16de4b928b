//! Shared data models for the VDQ fetch pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Queue messages (`FetchJob`) and their correlation ids
//! - Key fingerprints used for dedup and rate limiting
//! - Stored artifacts and their naming rules
//! - Progress relay messages
//! - Source URL sanitising

pub mod artifact;
pub mod fingerprint;
pub mod job;
pub mod progress;
pub mod utils;

// Re-export common types
pub use artifact::{artifact_key, content_type_for, download_file_name, Artifact};
pub use fingerprint::Fingerprint;
pub use job::{FetchJob, MessageId};
pub use progress::{DownloadProgress, DownloadStatus, ProgressEvent, ProgressMessage};
pub use utils::{sanitize_object_name, sanitize_url, UrlError, UrlResult};
