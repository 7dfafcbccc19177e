//! Frame extraction endpoints

use axum::{
    extract::{Path as AxumPath, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use super::files::{resolve_video_path, serve_stored_file};
use crate::error::{AppError, Result};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StartExtractionRequest {
    /// Recording file name inside the videos directory
    pub filename: String,
    /// Keep every Nth frame (default 1 = all)
    #[serde(default = "default_interval")]
    pub interval: u64,
    /// Output image format; only "jpg" is supported
    pub format: Option<String>,
}

fn default_interval() -> u64 {
    1
}

#[derive(Debug, Deserialize)]
pub struct CleanupRequest {
    #[serde(default)]
    pub keep_last_n: usize,
}

pub async fn start(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StartExtractionRequest>,
) -> Result<Json<serde_json::Value>> {
    if let Some(format) = request.format.as_deref() {
        if !format.eq_ignore_ascii_case("jpg") && !format.eq_ignore_ascii_case("jpeg") {
            return Err(AppError::InvalidArgument(format!(
                "output format {} is not supported",
                format
            )));
        }
    }

    let source = resolve_video_path(&state, &request.filename)?;
    let task_id = state.extraction.start(source, request.interval)?;
    Ok(Json(json!({ "success": true, "task_id": task_id })))
}

pub async fn status(
    State(state): State<Arc<AppState>>,
    AxumPath(task_id): AxumPath<String>,
) -> Result<Json<serde_json::Value>> {
    let status = state.extraction.status(&task_id)?;
    Ok(Json(json!({ "success": true, "status": status })))
}

pub async fn stop(
    State(state): State<Arc<AppState>>,
    AxumPath(task_id): AxumPath<String>,
) -> Result<Json<serde_json::Value>> {
    state.extraction.cancel(&task_id)?;
    Ok(Json(json!({ "success": true })))
}

/// Serve the archive produced by the external packager
pub async fn download(
    State(state): State<Arc<AppState>>,
    AxumPath(task_id): AxumPath<String>,
) -> Result<impl IntoResponse> {
    let status = state.extraction.status(&task_id)?;
    let archive = status
        .archive_path
        .ok_or_else(|| AppError::NotFound(format!("no archive for task {}", task_id)))?;

    let dir = archive
        .parent()
        .ok_or_else(|| AppError::NotFound("archive directory".to_string()))?;
    let name = archive
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| AppError::NotFound("archive name".to_string()))?;
    serve_stored_file(dir, name, true).await
}

/// Serve one extracted frame image
pub async fn preview(
    State(state): State<Arc<AppState>>,
    AxumPath((task_id, filename)): AxumPath<(String, String)>,
) -> Result<impl IntoResponse> {
    let status = state.extraction.status(&task_id)?;
    serve_stored_file(&status.output_dir, &filename, false).await
}

pub async fn cleanup(
    State(state): State<Arc<AppState>>,
    body: Option<Json<CleanupRequest>>,
) -> Result<Json<serde_json::Value>> {
    let keep = body.map(|Json(b)| b.keep_last_n).unwrap_or(0);
    let removed = state.extraction.cleanup_completed(keep);
    Ok(Json(json!({ "success": true, "removed": removed })))
}
