//! Archive download endpoint

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::pipeline::ArchiveLookup;
use crate::server::state::AppState;

/// GET /api/download/zip/:job_id - Download the converted images
///
/// 200 with the archive, 202 while the job runs, 204 when the job finished
/// without any converted file, 404 for unknown or expired jobs. A delivered
/// archive is deleted together with its job.
pub async fn download_zip(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Response> {
    let pipeline = state.pipeline();

    match pipeline.get_archive(job_id).await {
        ArchiveLookup::Ready(path) => {
            let data = Bytes::from(tokio::fs::read(&path).await.map_err(|e| {
                Error::storage(format!("Failed to read archive {}: {}", path.display(), e))
            })?);
            tracing::info!("Serving archive for job {} ({} bytes)", job_id, data.len());

            if let Err(e) = pipeline.acknowledge_download(job_id).await {
                tracing::warn!("Failed to clean up job {} after download: {}", job_id, e);
            }

            let headers = [
                (header::CONTENT_TYPE, "application/zip".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"converted-images-{}.zip\"", job_id),
                ),
            ];
            Ok((StatusCode::OK, headers, data).into_response())
        }
        ArchiveLookup::NotReady => {
            let status = pipeline.get_status(job_id).await.ok();
            Ok((
                StatusCode::ACCEPTED,
                Json(serde_json::json!({
                    "job_id": job_id,
                    "status": status.as_ref().map(|s| s.status),
                    "percent_complete": status.as_ref().map(|s| s.percent_complete),
                    "message": "Job is still processing",
                })),
            )
                .into_response())
        }
        ArchiveLookup::NoContent => Ok(StatusCode::NO_CONTENT.into_response()),
        ArchiveLookup::NotFound => Err(Error::JobNotFound(job_id)),
    }
}
