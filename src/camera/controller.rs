//! Capture controller
//!
//! The only component allowed to mutate capture state. Commands arrive on
//! a bounded channel and are handled one at a time by the dispatcher task;
//! a full queue rejects with `Busy` instead of queueing indefinitely.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::error::{AppError, Result};
use crate::video::bus::FrameBus;
use crate::video::capture::{CaptureConfig, CaptureSession, CaptureState};

/// Command queue depth; conflicting bursts are rejected, not queued
const COMMAND_QUEUE_DEPTH: usize = 8;
/// Bound on device open
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

enum Command {
    Open(CaptureConfig, oneshot::Sender<Result<()>>),
    Close(oneshot::Sender<Result<()>>),
    Start(oneshot::Sender<Result<()>>),
    Stop(oneshot::Sender<Result<()>>),
    SetParams(CaptureConfig, oneshot::Sender<Result<()>>),
}

/// Fields shared with status snapshots; read lock-free or behind
/// short-held locks that the capture path never touches.
struct ControllerShared {
    open: AtomicBool,
    capturing: AtomicBool,
    generation: AtomicU64,
    params: parking_lot::RwLock<Option<ActiveParams>>,
    last_error: parking_lot::RwLock<Option<String>>,
}

#[derive(Debug, Clone, Serialize)]
struct ActiveParams {
    device_path: PathBuf,
    width: u32,
    height: u32,
    fps: u32,
    format: String,
}

/// On-demand status snapshot
#[derive(Debug, Clone, Serialize)]
pub struct CameraStatus {
    pub open: bool,
    pub capturing: bool,
    pub device_path: Option<PathBuf>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<u32>,
    pub format: Option<String>,
    pub last_error: Option<String>,
    pub frames_published: u64,
    pub recorder_stalls: u64,
}

/// Handle to the controller dispatcher
#[derive(Clone)]
pub struct CameraController {
    tx: mpsc::Sender<Command>,
    shared: Arc<ControllerShared>,
    bus: Arc<FrameBus>,
}

impl CameraController {
    /// Spawn the dispatcher task and return its handle
    pub fn spawn(bus: Arc<FrameBus>) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let shared = Arc::new(ControllerShared {
            open: AtomicBool::new(false),
            capturing: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            params: parking_lot::RwLock::new(None),
            last_error: parking_lot::RwLock::new(None),
        });

        let dispatcher = Dispatcher {
            shared: shared.clone(),
            bus: bus.clone(),
            session: None,
        };
        tokio::spawn(dispatcher.run(rx));

        Self { tx, shared, bus }
    }

    pub fn bus(&self) -> Arc<FrameBus> {
        self.bus.clone()
    }

    pub async fn open(&self, config: CaptureConfig) -> Result<()> {
        self.send(|reply| Command::Open(config, reply)).await
    }

    pub async fn close(&self) -> Result<()> {
        self.send(Command::Close).await
    }

    pub async fn start(&self) -> Result<()> {
        self.send(Command::Start).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.send(Command::Stop).await
    }

    /// Stop, reconfigure and restart atomically; restores the previous
    /// configuration if the new one cannot be applied.
    pub async fn set_params(&self, config: CaptureConfig) -> Result<()> {
        self.send(|reply| Command::SetParams(config, reply)).await
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    pub fn is_capturing(&self) -> bool {
        self.shared.capturing.load(Ordering::SeqCst)
    }

    /// Computed on demand; never acquires locks the capture path holds
    pub fn status(&self) -> CameraStatus {
        let params = self.shared.params.read().clone();
        let bus_stats = self.bus.stats();
        CameraStatus {
            open: self.shared.open.load(Ordering::SeqCst),
            capturing: self.shared.capturing.load(Ordering::SeqCst),
            device_path: params.as_ref().map(|p| p.device_path.clone()),
            width: params.as_ref().map(|p| p.width),
            height: params.as_ref().map(|p| p.height),
            fps: params.as_ref().map(|p| p.fps),
            format: params.map(|p| p.format),
            last_error: self.shared.last_error.read().clone(),
            frames_published: bus_stats.frames_published,
            recorder_stalls: bus_stats.recorder_stalls,
        }
    }

    async fn send(&self, make: impl FnOnce(oneshot::Sender<Result<()>>) -> Command) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.try_send(make(reply_tx)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => AppError::Busy,
            mpsc::error::TrySendError::Closed(_) => {
                AppError::Internal("controller dispatcher gone".to_string())
            }
        })?;
        reply_rx
            .await
            .map_err(|_| AppError::Internal("controller dropped reply".to_string()))?
    }
}

struct Dispatcher {
    shared: Arc<ControllerShared>,
    bus: Arc<FrameBus>,
    session: Option<CaptureSession>,
}

impl Dispatcher {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Open(config, reply) => {
                    let _ = reply.send(self.handle_open(config).await);
                }
                Command::Close(reply) => {
                    let _ = reply.send(self.handle_close().await);
                }
                Command::Start(reply) => {
                    let _ = reply.send(self.handle_start().await);
                }
                Command::Stop(reply) => {
                    let _ = reply.send(self.handle_stop().await);
                }
                Command::SetParams(config, reply) => {
                    let _ = reply.send(self.handle_set_params(config).await);
                }
            }
        }
        info!("Controller dispatcher exiting");
    }

    async fn handle_open(&mut self, config: CaptureConfig) -> Result<()> {
        if self.session.is_some() {
            return Err(AppError::State("A device is already open".to_string()));
        }

        let session = self.open_session(config).await?;
        self.publish_params(&session);
        *self.shared.last_error.write() = None;
        self.shared.open.store(true, Ordering::SeqCst);
        self.session = Some(session);
        Ok(())
    }

    async fn handle_close(&mut self) -> Result<()> {
        let Some(session) = self.session.take() else {
            return Ok(()); // close is idempotent
        };

        self.shared.capturing.store(false, Ordering::SeqCst);
        self.shared.open.store(false, Ordering::SeqCst);
        *self.shared.params.write() = None;
        *self.shared.last_error.write() = None;

        if let Err(e) = session.close().await {
            warn!("Close: {}", e);
        }
        Ok(())
    }

    async fn handle_start(&mut self) -> Result<()> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| AppError::State("No device open".to_string()))?;

        session.start().await?;
        self.shared.capturing.store(true, Ordering::SeqCst);
        self.watch_session(session);
        Ok(())
    }

    async fn handle_stop(&mut self) -> Result<()> {
        let Some(session) = self.session.as_ref() else {
            return Err(AppError::State("No device open".to_string()));
        };

        let result = session.stop().await;
        self.shared.capturing.store(false, Ordering::SeqCst);
        result
    }

    async fn handle_set_params(&mut self, config: CaptureConfig) -> Result<()> {
        let Some(session) = self.session.take() else {
            return Err(AppError::State("No device open".to_string()));
        };

        let was_capturing = session.is_capturing();
        let previous_config = session.config().clone();

        self.shared.capturing.store(false, Ordering::SeqCst);
        self.shared.open.store(false, Ordering::SeqCst);
        if let Err(e) = session.close().await {
            warn!("SetParams: closing previous session: {}", e);
        }

        match self.open_session(config).await {
            Ok(new_session) => {
                self.publish_params(&new_session);
                self.shared.open.store(true, Ordering::SeqCst);
                self.session = Some(new_session);
            }
            Err(e) => {
                error!("SetParams failed, restoring previous configuration: {}", e);
                match self.open_session(previous_config).await {
                    Ok(restored) => {
                        self.publish_params(&restored);
                        self.shared.open.store(true, Ordering::SeqCst);
                        self.session = Some(restored);
                        if was_capturing {
                            self.restart_after_reconfig().await?;
                        }
                    }
                    Err(restore_err) => {
                        // Device is gone; reflect the closed state honestly
                        *self.shared.params.write() = None;
                        return Err(restore_err);
                    }
                }
                return Err(e);
            }
        }

        if was_capturing {
            self.restart_after_reconfig().await?;
        }
        Ok(())
    }

    async fn restart_after_reconfig(&mut self) -> Result<()> {
        let session = self.session.as_ref().expect("session just installed");
        session.start().await?;
        self.shared.capturing.store(true, Ordering::SeqCst);
        self.watch_session(session);
        Ok(())
    }

    async fn open_session(&self, config: CaptureConfig) -> Result<CaptureSession> {
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let bus = self.bus.clone();

        let open_task =
            tokio::task::spawn_blocking(move || CaptureSession::open(config, bus, generation));
        match tokio::time::timeout(OPEN_TIMEOUT, open_task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(AppError::Internal(format!("open task: {}", join_err))),
            Err(_) => Err(AppError::Timeout("device open".to_string())),
        }
    }

    /// Mirror capture-loop state transitions into the shared flags so a
    /// dead loop is visible to status without a controller command.
    fn watch_session(&self, session: &CaptureSession) {
        let shared = self.shared.clone();
        let generation = session.generation();
        let mut state_rx = session.state_watch();
        let last_error = session.error_handle();

        tokio::spawn(async move {
            loop {
                if state_rx.changed().await.is_err() {
                    break;
                }
                let state = *state_rx.borrow();
                if shared.generation.load(Ordering::SeqCst) != generation {
                    break; // a newer session took over
                }
                match state {
                    CaptureState::Capturing => {}
                    CaptureState::Ready => {
                        shared.capturing.store(false, Ordering::SeqCst);
                        break;
                    }
                    CaptureState::Failed => {
                        shared.capturing.store(false, Ordering::SeqCst);
                        *shared.last_error.write() = last_error.read().clone();
                        break;
                    }
                }
            }
        });
    }

    fn publish_params(&self, session: &CaptureSession) {
        let granted = session.granted();
        *self.shared.params.write() = Some(ActiveParams {
            device_path: session.config().device_path.clone(),
            width: granted.resolution.width,
            height: granted.resolution.height,
            fps: granted.fps,
            format: granted.format.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_commands_without_device() {
        let bus = FrameBus::new();
        let controller = CameraController::spawn(bus);

        assert!(!controller.is_open());
        assert!(matches!(
            controller.start().await,
            Err(AppError::State(_))
        ));
        assert!(matches!(controller.stop().await, Err(AppError::State(_))));
        // Close without a device is a no-op
        assert!(controller.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_open_missing_device_fails() {
        let bus = FrameBus::new();
        let controller = CameraController::spawn(bus);

        let config = CaptureConfig {
            device_path: "/dev/video-does-not-exist".into(),
            ..Default::default()
        };
        let result = controller.open(config).await;
        assert!(matches!(result, Err(AppError::DeviceNotFound(_))));
        assert!(!controller.is_open());
    }

    #[tokio::test]
    async fn test_status_snapshot_defaults() {
        let bus = FrameBus::new();
        let controller = CameraController::spawn(bus);

        let status = controller.status();
        assert!(!status.open);
        assert!(!status.capturing);
        assert!(status.device_path.is_none());
        assert!(status.last_error.is_none());
    }
}
