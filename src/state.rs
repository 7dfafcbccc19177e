use std::sync::Arc;
use tokio::sync::broadcast;

use crate::camera::CameraController;
use crate::config::AppConfig;
use crate::error::Result;
use crate::extract::ExtractionManager;
use crate::record::RecorderManager;
use crate::stream::StreamManager;
use crate::video::bus::FrameBus;
use crate::video::encoder::{JpegEncode, TurboJpegEncoder};

/// Application-wide state shared across handlers.
///
/// Every component is an explicit value composed once at startup; nothing
/// here is a global.
pub struct AppState {
    /// Static configuration
    pub config: AppConfig,
    /// Frame fan-out hub
    pub bus: Arc<FrameBus>,
    /// Capture controller (sole owner of capture state)
    pub controller: CameraController,
    /// Stream admission and client registry
    pub stream_manager: Arc<StreamManager>,
    /// Recording manager (single active session)
    pub recorder: RecorderManager,
    /// Frame extraction task registry
    pub extraction: ExtractionManager,
    /// Shutdown signal sender
    pub shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        bus: Arc<FrameBus>,
        controller: CameraController,
        stream_manager: Arc<StreamManager>,
        recorder: RecorderManager,
        extraction: ExtractionManager,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            bus,
            controller,
            stream_manager,
            recorder,
            extraction,
            shutdown_tx,
        })
    }

    /// Subscribe to the shutdown signal
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Fresh JPEG encoder for a new stream session
    pub fn new_encoder(&self) -> Result<Box<dyn JpegEncode>> {
        Ok(Box::new(TurboJpegEncoder::new(
            self.config.stream.default_jpeg_quality,
        )?))
    }
}
