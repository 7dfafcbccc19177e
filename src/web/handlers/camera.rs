//! Camera control endpoints

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{AppError, Result};
use crate::record::{RecordingStatus, RotationPolicy};
use crate::state::AppState;
use crate::video::capture::CaptureConfig;
use crate::video::device;
use crate::video::encoder::to_jpeg;
use crate::video::format::{PixelFormat, Resolution};

/// Body for `/api/camera/open`; omitted fields fall back to config
#[derive(Debug, Default, Deserialize)]
pub struct OpenRequest {
    pub device_path: Option<PathBuf>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<u32>,
    pub format: Option<String>,
}

impl OpenRequest {
    pub fn into_config(self, state: &AppState) -> Result<CaptureConfig> {
        let camera = &state.config.camera;
        let format = match self.format {
            Some(raw) => raw
                .parse::<PixelFormat>()
                .map_err(AppError::InvalidArgument)?,
            None => camera
                .default_format
                .parse::<PixelFormat>()
                .map_err(AppError::InvalidArgument)?,
        };

        let resolution = Resolution::new(
            self.width.unwrap_or(camera.default_width),
            self.height.unwrap_or(camera.default_height),
        );
        if !resolution.is_valid() {
            return Err(AppError::InvalidArgument(format!(
                "resolution {} out of range",
                resolution
            )));
        }

        Ok(CaptureConfig {
            device_path: self
                .device_path
                .unwrap_or_else(|| PathBuf::from(&camera.default_device)),
            resolution,
            format,
            fps: self.fps.unwrap_or(camera.default_fps),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StartRecordingRequest {
    /// Rotation overrides; defaults come from config
    pub max_duration_s: Option<u64>,
    pub max_size_bytes: Option<u64>,
    /// Only "mjpeg" is accepted
    pub format: Option<String>,
}

#[derive(Serialize)]
pub struct OkResponse {
    pub success: bool,
}

pub async fn open(
    State(state): State<Arc<AppState>>,
    body: Option<Json<OpenRequest>>,
) -> Result<Json<serde_json::Value>> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let config = request.into_config(&state)?;
    state.controller.open(config).await?;

    let status = state.controller.status();
    Ok(Json(json!({
        "success": true,
        "width": status.width,
        "height": status.height,
        "fps": status.fps,
        "format": status.format,
    })))
}

pub async fn close(State(state): State<Arc<AppState>>) -> Result<Json<OkResponse>> {
    state.controller.close().await?;
    Ok(Json(OkResponse { success: true }))
}

pub async fn start_preview(State(state): State<Arc<AppState>>) -> Result<Json<OkResponse>> {
    state.controller.start().await?;
    Ok(Json(OkResponse { success: true }))
}

pub async fn stop_preview(State(state): State<Arc<AppState>>) -> Result<Json<OkResponse>> {
    state.controller.stop().await?;
    Ok(Json(OkResponse { success: true }))
}

pub async fn capture(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>> {
    let path = capture_photo(&state).await?;
    Ok(Json(json!({
        "success": true,
        "filename": path.file_name().and_then(|n| n.to_str()),
    })))
}

/// Grab the latest published frame and persist it as a photo.
/// Shared by the REST handler and the WebSocket `capture_photo` command.
pub async fn capture_photo(state: &AppState) -> Result<PathBuf> {
    if !state.controller.is_capturing() {
        return Err(AppError::State("Camera is not capturing".to_string()));
    }
    let frame = state
        .bus
        .latest_frame()
        .ok_or_else(|| AppError::State("No frame captured yet".to_string()))?;

    let jpeg = if frame.is_jpeg() {
        frame.data_bytes()
    } else {
        let mut encoder = state.new_encoder()?;
        to_jpeg(encoder.as_mut(), &frame, state.config.stream.default_jpeg_quality)?
    };

    let now = chrono::Local::now();
    let filename = format!(
        "image_{}_{:03}.jpg",
        now.format("%Y%m%d_%H%M%S"),
        now.timestamp_subsec_millis()
    );
    let path = state.config.storage.photos_dir.join(filename);
    tokio::fs::write(&path, &jpeg).await?;

    tracing::info!("Captured photo: {} ({} bytes)", path.display(), jpeg.len());
    Ok(path)
}

pub async fn start_recording(
    State(state): State<Arc<AppState>>,
    body: Option<Json<StartRecordingRequest>>,
) -> Result<Json<serde_json::Value>> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let stem = begin_recording(&state, request).await?;
    Ok(Json(json!({
        "success": true,
        "output": stem,
    })))
}

/// Shared by REST and WebSocket recording commands
pub async fn begin_recording(
    state: &AppState,
    request: StartRecordingRequest,
) -> Result<PathBuf> {
    if let Some(format) = request.format.as_deref() {
        if !format.eq_ignore_ascii_case("mjpeg") {
            return Err(AppError::UnsupportedFormat(format!(
                "recording container {} is not supported",
                format
            )));
        }
    }
    if !state.controller.is_capturing() {
        return Err(AppError::State("Camera is not capturing".to_string()));
    }

    let status = state.controller.status();
    let source_format = status
        .format
        .as_deref()
        .unwrap_or("MJPEG")
        .parse::<PixelFormat>()
        .map_err(AppError::InvalidArgument)?;

    let rotation = RotationPolicy {
        max_duration_s: request
            .max_duration_s
            .unwrap_or(state.config.recorder.rotate_max_duration_s),
        max_size_bytes: request
            .max_size_bytes
            .unwrap_or(state.config.recorder.rotate_max_bytes),
    };

    state
        .recorder
        .start(&state.bus, source_format, Some(rotation))
        .await
}

pub async fn stop_recording(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>> {
    let status = state.recorder.stop().await?;
    Ok(Json(recording_json(&status)))
}

pub fn recording_json(status: &RecordingStatus) -> serde_json::Value {
    json!({
        "success": status.error.is_none(),
        "state": status.state,
        "file": status.current_file,
        "bytes_written": status.bytes_written,
        "frames_written": status.frames_written,
        "duration_s": status.duration_s,
        "segments": status.segment_index,
        "frames_dropped": status.frames_dropped,
        "error": status.error,
    })
}

pub async fn status(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>> {
    Ok(Json(status_snapshot(&state).await))
}

/// Computed on demand, never cached
pub async fn status_snapshot(state: &AppState) -> serde_json::Value {
    let camera = state.controller.status();
    let recording = state.recorder.status().await;

    json!({
        "success": true,
        "camera": camera,
        "stream": {
            "clients": state.stream_manager.client_count(),
            "max_clients": state.stream_manager.max_clients(),
            "client_stats": state.stream_manager.client_stats(),
        },
        "recording": recording.as_ref().map(recording_json),
        "extraction": state.extraction.all_statuses(),
    })
}

pub async fn list_devices(
    State(_state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>> {
    let devices = tokio::task::spawn_blocking(device::enumerate_devices)
        .await
        .map_err(|e| AppError::Internal(format!("device probe task: {}", e)))??;
    Ok(Json(json!({
        "success": true,
        "devices": devices,
    })))
}
