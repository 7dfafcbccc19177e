//! Segmented video recording

mod recorder;
mod sink;

pub use recorder::{
    RecordingOptions, RecordingSession, RecordingState, RecordingStatus, RotationPolicy,
};
pub use sink::{MjpegSink, RecordSink};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{AppError, Result};
use crate::video::bus::FrameBus;
use crate::video::format::PixelFormat;

/// Owns the single active recording session
pub struct RecorderManager {
    videos_dir: PathBuf,
    default_rotation: RotationPolicy,
    current: Mutex<Option<Arc<RecordingSession>>>,
}

impl RecorderManager {
    pub fn new(videos_dir: impl AsRef<Path>, default_rotation: RotationPolicy) -> Self {
        Self {
            videos_dir: videos_dir.as_ref().to_path_buf(),
            default_rotation,
            current: Mutex::new(None),
        }
    }

    /// Start a recording named after the current wall-clock time.
    /// Returns the output stem of the new session.
    pub async fn start(
        &self,
        bus: &Arc<FrameBus>,
        source_format: PixelFormat,
        rotation: Option<RotationPolicy>,
    ) -> Result<PathBuf> {
        let mut current = self.current.lock().await;
        if let Some(session) = current.as_ref() {
            if session.is_active() {
                return Err(AppError::State("A recording is already active".to_string()));
            }
        }

        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let stem = self.videos_dir.join(format!("video_{}", stamp));
        let session = RecordingSession::start(
            bus,
            source_format,
            RecordingOptions {
                output_stem: stem.clone(),
                rotation: rotation.unwrap_or(self.default_rotation),
            },
        )?;

        *current = Some(Arc::new(session));
        Ok(stem)
    }

    /// Stop the active recording and return its final status.
    /// A failed recording is cleared here (its error stays in the returned
    /// status); stopping with nothing active is an error.
    pub async fn stop(&self) -> Result<RecordingStatus> {
        let mut current = self.current.lock().await;
        let Some(session) = current.take() else {
            return Err(AppError::State("No recording is active".to_string()));
        };

        let status = session.stop().await?;
        info!(
            "Recording stopped: {} frames, {} bytes",
            status.frames_written, status.bytes_written
        );
        Ok(status)
    }

    /// Status of the current (possibly finished or failed) session
    pub async fn status(&self) -> Option<RecordingStatus> {
        let current = self.current.lock().await;
        current.as_ref().map(|session| session.status())
    }

    pub async fn is_recording(&self) -> bool {
        let current = self.current.lock().await;
        current.as_ref().is_some_and(|session| session.is_active())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::format::Resolution;
    use crate::video::frame::Frame;
    use bytes::Bytes;
    use std::time::Duration;

    fn jpeg_frame(sequence: u64) -> Frame {
        let mut data = vec![0xFF, 0xD8];
        data.extend(vec![0u8; 128]);
        data.extend([0xFF, 0xD9]);
        Frame::from_bytes(
            Bytes::from(data),
            Resolution::VGA,
            PixelFormat::Mjpeg,
            sequence,
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_single_active_recording() {
        let dir = tempfile::tempdir().unwrap();
        let bus = FrameBus::new();
        let manager = RecorderManager::new(dir.path(), RotationPolicy::default());

        manager
            .start(&bus, PixelFormat::Mjpeg, None)
            .await
            .unwrap();
        let second = manager.start(&bus, PixelFormat::Mjpeg, None).await;
        assert!(matches!(second, Err(AppError::State(_))));

        bus.publish(jpeg_frame(0));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let status = manager.stop().await.unwrap();
        assert_eq!(status.state, RecordingState::Finalized);

        // After stop a new recording may start
        assert!(manager.start(&bus, PixelFormat::Mjpeg, None).await.is_ok());
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_without_recording() {
        let dir = tempfile::tempdir().unwrap();
        let manager = RecorderManager::new(dir.path(), RotationPolicy::default());
        assert!(matches!(manager.stop().await, Err(AppError::State(_))));
    }
}
