//! API routes for the batch server

pub mod download;
pub mod process;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use crate::server::state::AppState;

/// Every API endpoint as (method and path, description)
pub const ENDPOINTS: &[(&str, &str)] = &[
    ("POST /api/process/batch", "Upload images with conversion options"),
    ("GET /api/process/status/:job_id", "Get job and per-file status"),
    (
        "POST /api/process/retry/:job_id/:task_id",
        "Retry a failed file while the job runs",
    ),
    ("GET /api/process/system/status", "Queue and worker statistics"),
    ("GET /api/download/zip/:job_id", "Download converted images"),
];

/// Build all API routes
pub fn api_routes(max_upload_size: usize) -> Router<AppState> {
    Router::new()
        // Batch upload - with larger body limit for multipart uploads
        .route(
            "/process/batch",
            post(process::process_batch).layer(DefaultBodyLimit::max(max_upload_size)),
        )
        .route("/process/status/:job_id", get(process::job_status))
        .route("/process/retry/:job_id/:task_id", post(process::retry_task))
        .route("/process/system/status", get(process::system_status))
        // Download
        .route("/download/zip/:job_id", get(download::download_zip))
        // Info
        .route("/info", get(info))
}

/// API info endpoint
async fn info() -> axum::Json<serde_json::Value> {
    let endpoints: serde_json::Map<String, serde_json::Value> = ENDPOINTS
        .iter()
        .map(|(route, description)| (route.to_string(), (*description).into()))
        .collect();

    axum::Json(serde_json::json!({
        "name": "image-batch",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Batch image conversion with downloadable zip results",
        "formats": crate::types::OutputFormat::ALL,
        "endpoints": endpoints
    }))
}
