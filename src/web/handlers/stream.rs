//! HTTP MJPEG streaming endpoint

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, StatusCode},
    response::Response,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::stream::{mjpeg_part, ClientGuard, StreamParams, StreamSession, WRITE_TIMEOUT};
use crate::video::format::Resolution;

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub quality: Option<u8>,
    pub fps: Option<u32>,
}

/// `GET /api/stream` — multipart/x-mixed-replace MJPEG stream.
///
/// 409 when the device is not capturing, 503 when the client limit is
/// reached; both before any frame is written.
pub async fn mjpeg_stream(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
) -> Result<Response> {
    if !state.controller.is_capturing() {
        return Err(AppError::State("Camera is not capturing".to_string()));
    }

    let guard = ClientGuard::admit(state.stream_manager.clone())?;

    let target_size = match (query.width, query.height) {
        (Some(width), Some(height)) => Some(Resolution::new(width, height)),
        _ => None,
    };
    let params = StreamParams::new(
        query.quality.unwrap_or(state.config.stream.default_jpeg_quality),
        query.fps.unwrap_or(state.config.stream.default_max_fps),
        target_size,
    );
    let mut session = StreamSession::subscribe(&state.bus, params, state.new_encoder()?)?;

    // The pump task pushes encoded parts into a small channel; hyper
    // consumes it as the response body. A send that cannot complete within
    // the write budget means the client stopped reading.
    let (tx, mut rx) = tokio::sync::mpsc::channel::<bytes::Bytes>(2);

    let manager = state.stream_manager.clone();
    tokio::spawn(async move {
        while let Some(jpeg) = session.next_jpeg().await {
            let part = mjpeg_part(&jpeg);
            match tokio::time::timeout(WRITE_TIMEOUT, tx.send(part)).await {
                Ok(Ok(())) => manager.record_frame_sent(guard.id()),
                Ok(Err(_)) => break,  // client went away
                Err(_) => {
                    debug!("Stream client {} write stalled past budget", guard.id());
                    break;
                }
            }
        }
        // Dropping guard + session unregisters the client and drains the
        // inbox, releasing held frames.
    });

    let body_stream = async_stream::stream! {
        while let Some(part) = rx.recv().await {
            yield Ok::<bytes::Bytes, std::io::Error>(part);
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            "multipart/x-mixed-replace; boundary=frame",
        )
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .header(header::PRAGMA, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(body_stream))
        .map_err(|e| AppError::Internal(e.to_string()))
}
