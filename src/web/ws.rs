//! `/ws/video` — control commands and binary frame streaming on one socket
//!
//! Text messages are JSON commands; server-to-client binary messages each
//! carry one JPEG frame. Every connection owns exactly one bus subscriber.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::handlers::camera::{
    begin_recording, capture_photo, recording_json, status_snapshot, OpenRequest,
    StartRecordingRequest,
};
use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::stream::{ClientGuard, StreamParams, StreamSession, WRITE_TIMEOUT};
use crate::video::device;

/// Client-to-server command
#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum WsCommand {
    StartCamera {
        device: Option<PathBuf>,
        width: Option<u32>,
        height: Option<u32>,
        fps: Option<u32>,
        format: Option<String>,
    },
    StopCamera,
    CapturePhoto,
    StartRecording {
        max_duration_s: Option<u64>,
        max_size_bytes: Option<u64>,
        format: Option<String>,
    },
    StopRecording,
    GetStatus,
    GetInfo,
}

pub async fn video_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    // Admission before anything is sent; a denial is the only frame the
    // client ever sees.
    let guard = match ClientGuard::admit(state.stream_manager.clone()) {
        Ok(guard) => guard,
        Err(e) => {
            let _ = sender
                .send(Message::Text(
                    json!({ "type": "error", "message": e.to_string() }).to_string(),
                ))
                .await;
            let _ = sender.close().await;
            return;
        }
    };

    info!("WebSocket video client {} connected", guard.id());

    let welcome = json!({
        "type": "welcome",
        "client_id": guard.id(),
        "available_commands": [
            "start_camera", "stop_camera", "capture_photo",
            "start_recording", "stop_recording", "get_status", "get_info"
        ],
    });
    if sender.send(Message::Text(welcome.to_string())).await.is_err() {
        return;
    }

    // Subscribe immediately when frames are already flowing
    let mut session = if state.controller.is_capturing() {
        subscribe_session(&state).ok()
    } else {
        None
    };

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let response = dispatch(&state, &text, &mut session).await;
                        let payload = match response {
                            Ok(value) => value,
                            Err(e) => json!({ "type": "error", "message": e.to_string() }),
                        };
                        if sender.send(Message::Text(payload.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket video client {} disconnected", guard.id());
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket receive error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            jpeg = next_frame(&mut session) => {
                match jpeg {
                    Some(jpeg) => {
                        if !send_binary(&mut sender, jpeg.to_vec()).await {
                            break;
                        }
                        state.stream_manager.record_frame_sent(guard.id());
                    }
                    None => {
                        // Capture ended; tell the client and wait for commands
                        session = None;
                        let note = json!({ "type": "status", "streaming": false });
                        if sender.send(Message::Text(note.to_string())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    // guard and session drop here: unregistration + inbox drain
}

/// Resolves with the next deliverable frame, or pends forever while no
/// stream subscription is active (commands still flow meanwhile).
async fn next_frame(session: &mut Option<StreamSession>) -> Option<bytes::Bytes> {
    match session.as_mut() {
        Some(active) => active.next_jpeg().await,
        None => std::future::pending().await,
    }
}

/// A binary write that cannot finish within the budget ends the session
async fn send_binary(
    sender: &mut SplitSink<WebSocket, Message>,
    payload: Vec<u8>,
) -> bool {
    match tokio::time::timeout(WRITE_TIMEOUT, sender.send(Message::Binary(payload))).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!("WebSocket send failed: {}", e);
            false
        }
        Err(_) => {
            debug!("WebSocket send stalled past {:?}", WRITE_TIMEOUT);
            false
        }
    }
}

fn subscribe_session(state: &Arc<AppState>) -> Result<StreamSession> {
    let params = StreamParams::new(
        state.config.stream.default_jpeg_quality,
        state.config.stream.default_max_fps,
        None,
    );
    StreamSession::subscribe(&state.bus, params, state.new_encoder()?)
}

async fn dispatch(
    state: &Arc<AppState>,
    text: &str,
    session: &mut Option<StreamSession>,
) -> Result<serde_json::Value> {
    let command: WsCommand = serde_json::from_str(text)
        .map_err(|_| AppError::NotFound(format!("unrecognized command: {}", text.trim())))?;

    match command {
        WsCommand::StartCamera {
            device,
            width,
            height,
            fps,
            format,
        } => {
            if !state.controller.is_open() {
                let request = OpenRequest {
                    device_path: device,
                    width,
                    height,
                    fps,
                    format,
                };
                state.controller.open(request.into_config(state)?).await?;
            }
            state.controller.start().await?;
            if session.is_none() {
                *session = Some(subscribe_session(state)?);
            }
            Ok(json!({ "type": "success", "message": "camera started" }))
        }
        WsCommand::StopCamera => {
            state.controller.stop().await?;
            Ok(json!({ "type": "success", "message": "camera stopped" }))
        }
        WsCommand::CapturePhoto => {
            let path = capture_photo(state).await?;
            Ok(json!({
                "type": "success",
                "filename": path.file_name().and_then(|n| n.to_str()),
            }))
        }
        WsCommand::StartRecording {
            max_duration_s,
            max_size_bytes,
            format,
        } => {
            let stem = begin_recording(
                state,
                StartRecordingRequest {
                    max_duration_s,
                    max_size_bytes,
                    format,
                },
            )
            .await?;
            Ok(json!({ "type": "success", "output": stem }))
        }
        WsCommand::StopRecording => {
            let status = state.recorder.stop().await?;
            Ok(json!({ "type": "success", "recording": recording_json(&status) }))
        }
        WsCommand::GetStatus => Ok(json!({
            "type": "status",
            "status": status_snapshot(state).await,
        })),
        WsCommand::GetInfo => {
            let devices = tokio::task::spawn_blocking(device::enumerate_devices)
                .await
                .map_err(|e| AppError::Internal(format!("device probe task: {}", e)))??;
            Ok(json!({ "type": "info", "devices": devices }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_parsing() {
        let cmd: WsCommand =
            serde_json::from_str(r#"{"cmd":"start_camera","device":"/dev/video1"}"#).unwrap();
        assert!(matches!(
            cmd,
            WsCommand::StartCamera { device: Some(ref d), .. } if d == &PathBuf::from("/dev/video1")
        ));

        let cmd: WsCommand = serde_json::from_str(r#"{"cmd":"get_status"}"#).unwrap();
        assert!(matches!(cmd, WsCommand::GetStatus));

        // Unknown commands fail to parse into the typed dispatcher
        assert!(serde_json::from_str::<WsCommand>(r#"{"cmd":"reboot"}"#).is_err());
    }
}
