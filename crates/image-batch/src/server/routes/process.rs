//! Batch upload, job status and retry endpoints

use axum::{
    extract::{multipart::Field, Multipart, Path, State},
    http::StatusCode,
    Json,
};
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::UploadConfig;
use crate::error::{Error, Result};
use crate::pipeline::{PipelineStats, SourceFile};
use crate::server::state::AppState;
use crate::storage::WorkingArea;
use crate::types::{ConversionOptions, JobStatusView, OptionsRequest, OutputFormat, ResizeFit, TaskId};

/// Response from batch submission
#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub job_id: Uuid,
    pub status: String,
    pub total_files: usize,
    pub message: String,
}

/// `options` field: one set for every file or one per file
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OptionsField {
    PerFile(Vec<OptionsRequest>),
    Shared(OptionsRequest),
}

/// Files and options read from a multipart body
struct BatchUpload {
    files: Vec<SourceFile>,
    options: Vec<ConversionOptions>,
}

/// POST /api/process/batch - Upload images for conversion
pub async fn process_batch(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<BatchResponse>)> {
    let pipeline = state.pipeline();
    let area = pipeline.allocate_working_area().await?;

    let result = match receive_batch(&state, &area, &mut multipart).await {
        Ok(upload) => pipeline.create_batch(area.clone(), upload.files, upload.options),
        Err(e) => Err(e),
    };

    match result {
        Ok(job_id) => {
            let total_files = pipeline
                .registry()
                .get_job(&job_id)
                .map(|j| j.tasks.len())
                .unwrap_or_default();
            Ok((
                StatusCode::ACCEPTED,
                Json(BatchResponse {
                    job_id,
                    status: "queued".to_string(),
                    total_files,
                    message: format!(
                        "Batch queued. Use /api/process/status/{} to check progress.",
                        job_id
                    ),
                }),
            ))
        }
        Err(e) => {
            tracing::warn!("Rejected batch: {}", e);
            if let Err(reclaim_err) = pipeline.storage().reclaim(&area).await {
                tracing::error!("Failed to reclaim rejected upload area: {}", reclaim_err);
            }
            Err(e)
        }
    }
}

/// Read every multipart field, storing accepted files in `area`
async fn receive_batch(
    state: &AppState,
    area: &WorkingArea,
    multipart: &mut Multipart,
) -> Result<BatchUpload> {
    let limits = &state.config().upload;
    let storage = state.pipeline().storage();

    let mut files = Vec::new();
    let mut options_field: Option<OptionsField> = None;
    let mut flat = OptionsRequest::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::validation(format!("Failed to read multipart field: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            "options" => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| Error::validation(format!("Failed to read options: {}", e)))?;
                options_field = Some(serde_json::from_slice(&data)?);
            }
            "format" | "width" | "height" | "quality" | "fit" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| Error::validation(format!("Failed to read {}: {}", name, e)))?;
                apply_flat_option(&mut flat, &name, value.trim())?;
            }
            _ => {
                let Some(file_name) = field.file_name().map(|s| s.to_string()) else {
                    tracing::debug!("Ignoring non-file field '{}'", name);
                    continue;
                };

                if files.len() >= limits.max_files {
                    return Err(Error::validation(format!(
                        "Too many files, limit is {}",
                        limits.max_files
                    )));
                }
                if !limits.is_allowed(&file_name) {
                    return Err(Error::UnsupportedFormat(format!(
                        "{} (allowed: {})",
                        file_name,
                        limits.allowed_extensions.join(", ")
                    )));
                }

                let data = read_limited(field, &file_name, limits).await?;
                if data.is_empty() {
                    return Err(Error::validation(format!("{} is empty", file_name)));
                }

                let path = storage
                    .store_input(area, files.len(), &file_name, &data)
                    .await?;
                tracing::info!("Received file: {} ({} bytes)", file_name, data.len());
                files.push(SourceFile::new(file_name, path));
            }
        }
    }

    if files.is_empty() {
        return Err(Error::validation("No files provided"));
    }

    let requests = match options_field {
        Some(OptionsField::PerFile(list)) => list,
        Some(OptionsField::Shared(one)) => vec![one],
        None => vec![flat],
    };
    let options = requests
        .into_iter()
        .map(OptionsRequest::into_options)
        .collect::<Result<Vec<_>>>()?;

    Ok(BatchUpload { files, options })
}

/// Read a file field, failing as soon as it exceeds the size limit
async fn read_limited(mut field: Field<'_>, file_name: &str, limits: &UploadConfig) -> Result<BytesMut> {
    let mut data = BytesMut::new();
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| Error::validation(format!("Failed to read {}: {}", file_name, e)))?
    {
        if (data.len() + chunk.len()) as u64 > limits.max_file_size {
            return Err(Error::validation(format!(
                "{} exceeds the maximum file size of {} bytes",
                file_name, limits.max_file_size
            )));
        }
        data.extend_from_slice(&chunk);
    }
    Ok(data)
}

fn apply_flat_option(options: &mut OptionsRequest, name: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Ok(());
    }
    let invalid = |_| Error::validation(format!("Invalid {}: {:?}", name, value));

    match name {
        "format" => options.format = Some(value.to_string()),
        "width" => options.width = Some(value.parse().map_err(invalid)?),
        "height" => options.height = Some(value.parse().map_err(invalid)?),
        "quality" => options.quality = Some(value.parse().map_err(invalid)?),
        "fit" => {
            options.fit = Some(match value.to_lowercase().as_str() {
                "inside" => ResizeFit::Inside,
                "fill" => ResizeFit::Fill,
                _ => return Err(Error::validation(format!("Invalid fit: {:?}", value))),
            })
        }
        _ => {}
    }
    Ok(())
}

/// GET /api/process/status/:job_id - Get job status
pub async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusView>> {
    Ok(Json(state.pipeline().get_status(job_id).await?))
}

/// Response from a retry request
#[derive(Debug, Serialize)]
pub struct RetryResponse {
    pub job_id: Uuid,
    pub task_id: TaskId,
    pub status: String,
}

/// POST /api/process/retry/:job_id/:task_id - Retry a failed file
pub async fn retry_task(
    State(state): State<AppState>,
    Path((job_id, task_id)): Path<(Uuid, TaskId)>,
) -> Result<Json<RetryResponse>> {
    state.pipeline().retry_task(job_id, task_id)?;
    Ok(Json(RetryResponse {
        job_id,
        task_id,
        status: "pending".to_string(),
    }))
}

/// Upload limits reported by the system status endpoint
#[derive(Debug, Serialize)]
pub struct UploadLimits {
    pub max_files: usize,
    pub max_file_size: u64,
    pub allowed_extensions: Vec<String>,
    pub output_formats: Vec<OutputFormat>,
}

/// System status response
#[derive(Debug, Serialize)]
pub struct SystemStatusResponse {
    pub status: String,
    pub uptime_secs: i64,
    pub pipeline: PipelineStats,
    pub limits: UploadLimits,
}

/// GET /api/process/system/status - Queue statistics
pub async fn system_status(State(state): State<AppState>) -> Json<SystemStatusResponse> {
    let upload = &state.config().upload;
    Json(SystemStatusResponse {
        status: "operational".to_string(),
        uptime_secs: state.uptime_secs(),
        pipeline: state.pipeline().stats(),
        limits: UploadLimits {
            max_files: upload.max_files,
            max_file_size: upload.max_file_size,
            allowed_extensions: upload.allowed_extensions.clone(),
            output_formats: OutputFormat::ALL.to_vec(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_field_shapes() {
        let shared: OptionsField = serde_json::from_str(r#"{"format":"png","width":100}"#).unwrap();
        assert!(matches!(shared, OptionsField::Shared(ref o) if o.width == Some(100)));

        let per_file: OptionsField =
            serde_json::from_str(r#"[{"format":"jpeg"},{"format":"webp","quality":50}]"#).unwrap();
        assert!(matches!(per_file, OptionsField::PerFile(ref v) if v.len() == 2));
    }

    #[test]
    fn test_flat_options() {
        let mut request = OptionsRequest::default();
        apply_flat_option(&mut request, "format", "jpg").unwrap();
        apply_flat_option(&mut request, "width", "640").unwrap();
        apply_flat_option(&mut request, "fit", "Fill").unwrap();
        apply_flat_option(&mut request, "height", "").unwrap();

        let options = request.into_options().unwrap();
        assert_eq!(options.format, OutputFormat::Jpeg);
        assert_eq!(options.width, Some(640));
        assert_eq!(options.height, None);
        assert_eq!(options.fit, ResizeFit::Fill);

        let mut request = OptionsRequest::default();
        assert!(apply_flat_option(&mut request, "quality", "high").is_err());
    }
}
