//! Queue message definitions.

use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Fingerprint;

/// Broker-assigned id of a single publish.
///
/// Correlates log lines for one delivery. It is not an identity for dedup:
/// every republish gets a fresh one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A request to fetch one remote media resource.
///
/// Wire format: `{key, client_ref, attempt, enqueued_at}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FetchJob {
    /// Source URL; the unit of dedup and fingerprinting
    pub key: String,
    /// Where progress events go; `None` for queue-only submissions
    #[serde(default)]
    pub client_ref: Option<String>,
    /// Retry count of this message lineage, 0 on first publish
    #[serde(default)]
    pub attempt: u32,
    /// Restamped on every publish, including republish
    pub enqueued_at: DateTime<Utc>,
}

impl FetchJob {
    /// Create a first-attempt job for a key.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            client_ref: None,
            attempt: 0,
            enqueued_at: Utc::now(),
        }
    }

    /// Route progress for this job to a client.
    pub fn with_client_ref(mut self, client_ref: impl Into<String>) -> Self {
        self.client_ref = Some(client_ref.into());
        self
    }

    /// Fingerprint of the job key.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.key)
    }

    /// The same logical job with the attempt counter advanced.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            ..self.clone()
        }
    }

    /// Whether this message lineage has used up its attempts.
    pub fn is_exhausted(&self, max_attempts: u32) -> bool {
        self.attempt >= max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let job = FetchJob::new("https://x/a").with_client_ref("client-1");
        let value = serde_json::to_value(&job).unwrap();

        assert_eq!(value["key"], "https://x/a");
        assert_eq!(value["client_ref"], "client-1");
        assert_eq!(value["attempt"], 0);
        assert!(value["enqueued_at"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_decode_queue_only_submission() {
        let job: FetchJob = serde_json::from_str(
            r#"{"key":"https://x/a","client_ref":null,"attempt":3,"enqueued_at":"2024-05-01T10:00:00Z"}"#,
        )
        .unwrap();

        assert_eq!(job.client_ref, None);
        assert_eq!(job.attempt, 3);
    }

    #[test]
    fn test_missing_key_is_rejected() {
        let payload = r#"{"attempt":0,"enqueued_at":"2024-05-01T10:00:00Z"}"#;
        let result = serde_json::from_str::<FetchJob>(payload);
        assert!(result.is_err());
    }

    #[test]
    fn test_next_attempt_keeps_lineage() {
        let job = FetchJob::new("https://x/a").with_client_ref("c");
        let next = job.next_attempt();

        assert_eq!(next.attempt, 1);
        assert_eq!(next.key, job.key);
        assert_eq!(next.client_ref, job.client_ref);
        assert_eq!(next.fingerprint(), job.fingerprint());
    }

    #[test]
    fn test_exhaustion_boundary() {
        let mut job = FetchJob::new("https://x/a");
        job.attempt = 4;
        assert!(!job.is_exhausted(5));
        job.attempt = 5;
        assert!(job.is_exhausted(5));
    }
}
