//! Fetch submission.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use validator::Validate;

use vdq_models::{sanitize_url, FetchJob};

use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::state::AppState;

/// Body of `POST /download`.
#[derive(Debug, Deserialize, Validate)]
pub struct DownloadRequest {
    #[serde(default)]
    #[validate(length(max = 2048, message = "URL too long"))]
    pub url: Option<String>,

    /// Progress registration to notify; submissions without one are queue-only
    #[serde(default)]
    #[validate(length(min = 1, max = 128, message = "client_id must be 1-128 characters"))]
    pub client_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DownloadResponse {
    pub success: bool,
    pub status: &'static str,
    pub message_id: String,
}

/// Validate, sanitise and enqueue one fetch.
pub async fn submit_download(
    State(state): State<AppState>,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<DownloadResponse>)> {
    let Json(request) = payload.map_err(|e| {
        debug!("Rejected download body: {}", e);
        ApiError::bad_request("Invalid request")
    })?;
    request.validate()?;

    let key = sanitize_url(request.url.as_deref().unwrap_or_default())?;

    let mut job = FetchJob::new(key);
    if let Some(client_id) = request.client_id {
        job = job.with_client_ref(client_id);
    }

    let message_id = state.publisher.publish(job.clone()).await?;
    metrics::record_job_enqueued();
    info!(
        message_id = %message_id,
        fingerprint = %job.fingerprint(),
        client_ref = job.client_ref.as_deref().unwrap_or("-"),
        "Download enqueued"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(DownloadResponse {
            success: true,
            status: "enqueued",
            message_id: message_id.to_string(),
        }),
    ))
}
