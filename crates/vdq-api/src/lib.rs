//! HTTP/WebSocket front end for the fetch queue.
//!
//! This crate provides:
//! - `POST /download` validation, URL sanitising and publish
//! - Per-IP submission rate limiting
//! - `GET /ws` progress subscription by client id
//! - Prometheus metrics

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod ws;

pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
