//! Job REST handlers
//!
//! Submission consumes an already-resolved set of `(filename, path)` pairs
//! plus the options record; upload handling and archive extraction belong
//! to an upstream collaborator, never to this service.

use axum::body::Body;
use axum::extract::{Host, Path, State};
use axum::http::header;
use axum::response::Response;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::manager::{JobRequest, SubmittedFile};
use crate::models::{FileFailure, FileStatus, Job, JobOptions, JobStatus};
use crate::AppState;
use auris_common::events::{ProgressEvent, Stage};

/// POST /api/jobs request
#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    /// Optional batch label, echoed in listings and the download filename
    pub label: Option<String>,
    #[serde(default)]
    pub options: JobOptions,
    pub files: Vec<SubmittedFile>,
}

/// POST /api/jobs response
#[derive(Debug, Serialize)]
pub struct SubmitJobResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub ws_url: String,
    pub status_url: String,
    pub files_url: String,
    pub download_url: String,
}

/// Per-file view shared by the status and files endpoints
#[derive(Debug, Serialize)]
pub struct FileView {
    pub filename: String,
    pub status: FileStatus,
    pub stage: Option<Stage>,
    pub percent: u8,
    pub error: Option<FileFailure>,
    pub output_path: Option<String>,
}

/// GET /api/jobs/{id}/status response
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub label: String,
    pub status: JobStatus,
    pub options: JobOptions,
    pub error: Option<String>,
    pub total_files: usize,
    pub processed_files: usize,
    pub percent: f64,
    pub last_sequence: u64,
    pub artifact_ready: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub files: Vec<FileView>,
    /// Recent event tail (bounded snapshot; full history is on the WebSocket)
    pub recent_events: Vec<ProgressEvent>,
    pub download_url: String,
}

/// GET /api/jobs entry
#[derive(Debug, Serialize)]
pub struct JobListEntry {
    pub job_id: Uuid,
    pub label: String,
    pub status: JobStatus,
    pub error: Option<String>,
    pub total_files: usize,
    pub processed_files: usize,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub download_url: String,
}

fn file_views(job: &Job) -> Vec<FileView> {
    job.files
        .iter()
        .map(|f| FileView {
            filename: f.filename.clone(),
            status: f.status,
            stage: f.stage,
            percent: f.percent,
            error: f.error.clone(),
            output_path: f.output_path.clone(),
        })
        .collect()
}

fn status_response(job: &Job, recent_events: Vec<ProgressEvent>) -> JobStatusResponse {
    JobStatusResponse {
        job_id: job.id,
        label: job.label.clone(),
        status: job.status,
        options: job.options.clone(),
        error: job.error.clone(),
        total_files: job.files.len(),
        processed_files: job.completed_files(),
        percent: job.progress_percent(),
        last_sequence: job.last_seq,
        artifact_ready: job.artifact_ready,
        created_at: job.created_at,
        started_at: job.started_at,
        finished_at: job.finished_at,
        files: file_views(job),
        recent_events,
        download_url: format!("/api/jobs/{}/download", job.id),
    }
}

/// POST /api/jobs
///
/// Validates and registers a job, enqueues it, and returns the observer
/// URLs. Malformed submissions are rejected with 400 before any job record
/// exists.
pub async fn submit_job(
    State(state): State<AppState>,
    Host(host): Host,
    Json(request): Json<SubmitJobRequest>,
) -> ApiResult<Json<SubmitJobResponse>> {
    let job = state
        .manager
        .submit(JobRequest {
            label: request.label,
            options: request.options,
            files: request.files,
        })
        .await?;

    Ok(Json(SubmitJobResponse {
        job_id: job.id,
        status: job.status,
        ws_url: format!("ws://{host}/ws/{}", job.id),
        status_url: format!("/api/jobs/{}/status", job.id),
        files_url: format!("/api/jobs/{}/files", job.id),
        download_url: format!("/api/jobs/{}/download", job.id),
    }))
}

/// GET /api/jobs
///
/// Most recently created first, reconstructed from the store alone
/// (survives restarts).
pub async fn list_jobs(
    State(state): State<AppState>,
) -> ApiResult<Json<serde_json::Value>> {
    let jobs = state.manager.store().list().await?;
    let entries: Vec<JobListEntry> = jobs
        .iter()
        .map(|job| JobListEntry {
            job_id: job.id,
            label: job.label.clone(),
            status: job.status,
            error: job.error.clone(),
            total_files: job.files.len(),
            processed_files: job.completed_files(),
            created_at: job.created_at,
            finished_at: job.finished_at,
            download_url: format!("/api/jobs/{}/download", job.id),
        })
        .collect();
    Ok(Json(serde_json::json!({ "jobs": entries })))
}

/// GET /api/jobs/{id}/status
pub async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<JobStatusResponse>> {
    let job = state
        .manager
        .store()
        .get(job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job not found: {job_id}")))?;
    let recent = state.manager.bus().snapshot(job_id);
    Ok(Json(status_response(&job, recent)))
}

/// GET /api/jobs/{id}/files
pub async fn job_files(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let job = state
        .manager
        .store()
        .get(job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job not found: {job_id}")))?;
    Ok(Json(serde_json::json!({
        "job_id": job.id,
        "status": job.status,
        "files": file_views(&job),
    })))
}

/// GET /api/jobs/{id}/download
///
/// Streams the packaged artifact, building it on demand when outputs exist
/// but the archive has not been materialized yet.
pub async fn job_download(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Response> {
    let (job, artifact) = state.manager.ensure_artifact(job_id).await?;

    let file = tokio::fs::File::open(&artifact).await?;
    let stream = ReaderStream::new(file);

    let suggested = format!("{}-enhanced.zip", sanitize_label(&job.label));
    let response = Response::builder()
        .header(header::CONTENT_TYPE, "application/zip")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{suggested}\""),
        )
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(response)
}

/// POST /api/jobs/{id}/cancel
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let job = state.manager.cancel(job_id).await?;
    Ok(Json(serde_json::json!({
        "job_id": job.id,
        "status": job.status,
    })))
}

/// Keep alphanumerics, `-` and `_` in download filenames
fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "job".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_sanitized_for_download_names() {
        assert_eq!(sanitize_label("My Voices (v2)"), "My-Voices--v2-");
        assert_eq!(sanitize_label("takes_2024-01"), "takes_2024-01");
        assert_eq!(sanitize_label(""), "job");
    }
}
