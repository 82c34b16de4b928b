//! Application state.

use std::sync::Arc;

use vdq_queue::{JobPublisher, ProgressSubscriber};

use crate::config::ApiConfig;
use crate::middleware::RateLimiterCache;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub publisher: Arc<dyn JobPublisher>,
    pub progress: Arc<ProgressSubscriber>,
    pub rate_limiter: Arc<RateLimiterCache>,
}

impl AppState {
    pub fn new(
        config: ApiConfig,
        publisher: Arc<dyn JobPublisher>,
        progress: Arc<ProgressSubscriber>,
    ) -> Self {
        let rate_limiter = Arc::new(RateLimiterCache::per_hour(config.rate_limit_per_hour));
        Self {
            config,
            publisher,
            progress,
            rate_limiter,
        }
    }
}
