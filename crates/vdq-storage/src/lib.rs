//! Artifact storage for the VDQ fetch pipeline.
//!
//! This crate provides:
//! - S3-compatible object storage via the AWS SDK
//! - The `ArtifactStore` seam with an in-memory implementation
//! - Dedup lookups that ignore undersized leftovers

pub mod client;
pub mod error;
pub mod idempotency;
pub mod store;

pub use client::{S3Config, S3Store};
pub use error::{StorageError, StorageResult};
pub use idempotency::{IdempotencyStore, DEFAULT_MIN_VALID_SIZE};
pub use store::{ArtifactStore, MemoryArtifactStore};
