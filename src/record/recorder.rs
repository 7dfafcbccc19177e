//! Recording worker: segmented single-writer file sink
//!
//! One recording is active at a time (enforced by the bus's recorder
//! invariant). Frames arrive through a block-bounded inbox of capacity 2;
//! segments are written to a `.tmp` path and renamed into place on
//! rotation or finalize.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::sink::{MjpegSink, RecordSink};
use crate::error::{AppError, Result};
use crate::video::bus::{BusEvent, DropPolicy, FrameBus, SubscriberHandle, SubscriberKind};
use crate::video::format::PixelFormat;
use crate::video::frame::Frame;

/// Recorder inbox depth
const RECORDER_INBOX: usize = 2;
/// Bound on draining the inbox at stop
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
/// Recording file extension
const EXTENSION: &str = "mjpeg";

/// Recording session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingState {
    Starting,
    Active,
    Rotating,
    Finalizing,
    Finalized,
    Failed,
}

/// Rotation thresholds; 0 = unlimited
#[derive(Debug, Clone, Copy, Default)]
pub struct RotationPolicy {
    pub max_duration_s: u64,
    pub max_size_bytes: u64,
}

/// Options for one recording session
#[derive(Debug, Clone)]
pub struct RecordingOptions {
    /// Final path without `_partK` or extension, e.g. `videos/video_20250101_120000`
    pub output_stem: PathBuf,
    pub rotation: RotationPolicy,
}

/// Status snapshot of a recording session
#[derive(Debug, Clone, Serialize)]
pub struct RecordingStatus {
    pub state: RecordingState,
    pub current_file: PathBuf,
    pub bytes_written: u64,
    pub frames_written: u64,
    pub duration_s: f64,
    pub segment_index: u32,
    pub frames_dropped: u64,
    pub error: Option<String>,
}

struct RecorderShared {
    state: parking_lot::RwLock<RecordingState>,
    current_file: parking_lot::RwLock<PathBuf>,
    bytes_total: AtomicU64,
    bytes_segment: AtomicU64,
    frames: AtomicU64,
    segment_index: AtomicU32,
    error: parking_lot::RwLock<Option<String>>,
    started_at: Instant,
}

impl RecorderShared {
    fn set_state(&self, state: RecordingState) {
        *self.state.write() = state;
    }

    fn state(&self) -> RecordingState {
        *self.state.read()
    }

    fn fail(&self, message: String) {
        error!("Recording failed: {}", message);
        *self.error.write() = Some(message);
        self.set_state(RecordingState::Failed);
    }
}

/// A live (or finished) recording session
pub struct RecordingSession {
    shared: Arc<RecorderShared>,
    options: RecordingOptions,
    cancel: CancellationToken,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
    subscriber_dropped: Arc<AtomicU64>,
}

impl RecordingSession {
    /// Start recording: registers the recorder subscriber, opens the first
    /// segment and spawns the worker.
    pub fn start(
        bus: &Arc<FrameBus>,
        source_format: PixelFormat,
        options: RecordingOptions,
    ) -> Result<Self> {
        if source_format != PixelFormat::Mjpeg {
            return Err(AppError::UnsupportedFormat(format!(
                "recording requires an MJPEG source, got {}",
                source_format
            )));
        }

        let subscriber = bus.subscribe(
            SubscriberKind::Recorder,
            RECORDER_INBOX,
            DropPolicy::BlockBounded,
        )?;

        let first_tmp = segment_tmp_path(&options.output_stem, 1);
        if let Some(parent) = first_tmp.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let sink = MjpegSink::create(&first_tmp)?;

        let shared = Arc::new(RecorderShared {
            state: parking_lot::RwLock::new(RecordingState::Starting),
            current_file: parking_lot::RwLock::new(first_tmp),
            bytes_total: AtomicU64::new(0),
            bytes_segment: AtomicU64::new(0),
            frames: AtomicU64::new(0),
            segment_index: AtomicU32::new(1),
            error: parking_lot::RwLock::new(None),
            started_at: Instant::now(),
        });

        let cancel = CancellationToken::new();
        let subscriber_dropped = Arc::new(AtomicU64::new(0));

        let worker = Worker {
            shared: shared.clone(),
            options: options.clone(),
            subscriber,
            sink: Box::new(sink),
            segment_started_at: Instant::now(),
            dropped_out: subscriber_dropped.clone(),
        };
        let token = cancel.clone();
        let handle = tokio::spawn(worker.run(token));

        shared.set_state(RecordingState::Active);
        info!(
            "Recording started: {}",
            options.output_stem.display()
        );

        Ok(Self {
            shared,
            options,
            cancel,
            worker: Mutex::new(Some(handle)),
            subscriber_dropped,
        })
    }

    /// Stop and finalize. Idempotent: stopping a finalized session is a
    /// successful no-op.
    pub async fn stop(&self) -> Result<RecordingStatus> {
        let state = self.shared.state();
        if state == RecordingState::Finalized || state == RecordingState::Failed {
            if let Some(handle) = self.worker.lock().await.take() {
                let _ = handle.await;
            }
            return Ok(self.status());
        }

        self.cancel.cancel();
        if let Some(handle) = self.worker.lock().await.take() {
            match tokio::time::timeout(DRAIN_TIMEOUT + Duration::from_secs(1), handle).await {
                Ok(_) => {}
                Err(_) => warn!("Recorder worker did not finish in time"),
            }
        }
        Ok(self.status())
    }

    pub fn status(&self) -> RecordingStatus {
        RecordingStatus {
            state: self.shared.state(),
            current_file: self.shared.current_file.read().clone(),
            bytes_written: self.shared.bytes_total.load(Ordering::Relaxed),
            frames_written: self.shared.frames.load(Ordering::Relaxed),
            duration_s: self.shared.started_at.elapsed().as_secs_f64(),
            segment_index: self.shared.segment_index.load(Ordering::Relaxed),
            frames_dropped: self.subscriber_dropped.load(Ordering::Relaxed),
            error: self.shared.error.read().clone(),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.shared.state(),
            RecordingState::Starting | RecordingState::Active | RecordingState::Rotating
        )
    }

    pub fn output_stem(&self) -> &PathBuf {
        &self.options.output_stem
    }
}

struct Worker {
    shared: Arc<RecorderShared>,
    options: RecordingOptions,
    subscriber: SubscriberHandle,
    sink: Box<dyn RecordSink>,
    segment_started_at: Instant,
    dropped_out: Arc<AtomicU64>,
}

impl Worker {
    async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.drain_and_finalize().await;
                    return;
                }
                event = self.subscriber.recv() => match event {
                    BusEvent::Frame(frame) => {
                        if !self.handle_frame(&frame) {
                            return; // Failed; .tmp retained for diagnosis
                        }
                    }
                    BusEvent::Closed => {
                        info!("Capture ended, finalizing recording");
                        self.finalize();
                        return;
                    }
                }
            }
        }
    }

    /// Returns false when the recording entered Failed
    fn handle_frame(&mut self, frame: &Frame) -> bool {
        self.dropped_out
            .store(self.subscriber.dropped(), Ordering::Relaxed);

        if self.rotation_due() {
            if let Err(e) = self.rotate() {
                self.shared.fail(format!("rotation: {}", e));
                return false;
            }
        }

        match self.sink.write_frame(frame) {
            Ok(written) => {
                self.shared.bytes_total.fetch_add(written, Ordering::Relaxed);
                self.shared
                    .bytes_segment
                    .fetch_add(written, Ordering::Relaxed);
                self.shared.frames.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.shared.fail(format!("write: {}", e));
                false
            }
        }
    }

    /// Evaluated before each write, so a frame that crosses a threshold
    /// lands entirely in the pre-rotation segment.
    fn rotation_due(&self) -> bool {
        let policy = self.options.rotation;
        if policy.max_duration_s > 0
            && self.segment_started_at.elapsed() >= Duration::from_secs(policy.max_duration_s)
        {
            return true;
        }
        if policy.max_size_bytes > 0
            && self.shared.bytes_segment.load(Ordering::Relaxed) >= policy.max_size_bytes
        {
            return true;
        }
        false
    }

    fn rotate(&mut self) -> Result<()> {
        self.shared.set_state(RecordingState::Rotating);

        let index = self.shared.segment_index.load(Ordering::Relaxed);
        self.sink.flush()?;

        let tmp = segment_tmp_path(&self.options.output_stem, index);
        let final_path = segment_final_path(&self.options.output_stem, index, true);
        std::fs::rename(&tmp, &final_path)?;
        info!("Rotated segment: {}", final_path.display());

        let next_index = index + 1;
        let next_tmp = segment_tmp_path(&self.options.output_stem, next_index);
        self.sink = Box::new(MjpegSink::create(&next_tmp)?);

        self.shared.segment_index.store(next_index, Ordering::Relaxed);
        self.shared.bytes_segment.store(0, Ordering::Relaxed);
        *self.shared.current_file.write() = next_tmp;
        self.segment_started_at = Instant::now();

        self.shared.set_state(RecordingState::Active);
        Ok(())
    }

    /// Consume whatever is left in the inbox, bounded by [`DRAIN_TIMEOUT`]
    async fn drain_and_finalize(&mut self) {
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while Instant::now() < deadline {
            match self.subscriber.try_recv() {
                Some(BusEvent::Frame(frame)) => {
                    if !self.handle_frame(&frame) {
                        return;
                    }
                }
                Some(BusEvent::Closed) | None => break,
            }
        }
        self.finalize();
    }

    fn finalize(&mut self) {
        if self.shared.state() == RecordingState::Finalized {
            return;
        }
        self.shared.set_state(RecordingState::Finalizing);

        if let Err(e) = self.sink.flush() {
            self.shared.fail(format!("finalize flush: {}", e));
            return;
        }

        let index = self.shared.segment_index.load(Ordering::Relaxed);
        let rotated = index > 1;
        let tmp = segment_tmp_path(&self.options.output_stem, index);
        let final_path = segment_final_path(&self.options.output_stem, index, rotated);

        if let Err(e) = std::fs::rename(&tmp, &final_path) {
            self.shared.fail(format!("finalize rename: {}", e));
            return;
        }

        *self.shared.current_file.write() = final_path.clone();
        self.shared.set_state(RecordingState::Finalized);
        info!(
            "Recording finalized: {} ({} frames, {} bytes)",
            final_path.display(),
            self.shared.frames.load(Ordering::Relaxed),
            self.shared.bytes_total.load(Ordering::Relaxed)
        );
    }
}

/// In-progress path of segment `index`
fn segment_tmp_path(stem: &PathBuf, index: u32) -> PathBuf {
    let mut name = stem.as_os_str().to_os_string();
    name.push(format!("_part{}.{}.tmp", index, EXTENSION));
    PathBuf::from(name)
}

/// Final path of segment `index`; an unrotated recording drops `_partK`
fn segment_final_path(stem: &PathBuf, index: u32, rotated: bool) -> PathBuf {
    let mut name = stem.as_os_str().to_os_string();
    if rotated {
        name.push(format!("_part{}.{}", index, EXTENSION));
    } else {
        name.push(format!(".{}", EXTENSION));
    }
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::format::Resolution;
    use bytes::Bytes;

    fn jpeg_frame(sequence: u64, payload: usize) -> Frame {
        let mut data = vec![0xFF, 0xD8];
        data.extend(vec![sequence as u8; payload]);
        data.extend([0xFF, 0xD9]);
        Frame::from_bytes(
            Bytes::from(data),
            Resolution::VGA,
            PixelFormat::Mjpeg,
            sequence,
        )
    }

    fn options(dir: &std::path::Path, rotation: RotationPolicy) -> RecordingOptions {
        RecordingOptions {
            output_stem: dir.join("video_20250101_120000"),
            rotation,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_record_and_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let bus = FrameBus::new();

        let session = RecordingSession::start(
            &bus,
            PixelFormat::Mjpeg,
            options(dir.path(), RotationPolicy::default()),
        )
        .unwrap();

        for seq in 0..10 {
            bus.publish(jpeg_frame(seq, 64));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let status = session.stop().await.unwrap();
        assert_eq!(status.state, RecordingState::Finalized);
        assert_eq!(status.frames_written, 10);
        assert_eq!(status.segment_index, 1);

        // Unrotated recording gets the plain name, no .tmp left behind
        let final_path = dir.path().join("video_20250101_120000.mjpeg");
        assert!(final_path.exists());
        assert!(!dir
            .path()
            .join("video_20250101_120000_part1.mjpeg.tmp")
            .exists());

        let data = std::fs::read(final_path).unwrap();
        assert_eq!(&data[..2], &[0xFF, 0xD8]);
        assert_eq!(&data[data.len() - 2..], &[0xFF, 0xD9]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let bus = FrameBus::new();

        let session = RecordingSession::start(
            &bus,
            PixelFormat::Mjpeg,
            options(dir.path(), RotationPolicy::default()),
        )
        .unwrap();

        bus.publish(jpeg_frame(0, 64));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let first = session.stop().await.unwrap();
        assert_eq!(first.state, RecordingState::Finalized);
        // Second stop succeeds and changes nothing
        let second = session.stop().await.unwrap();
        assert_eq!(second.state, RecordingState::Finalized);
        assert_eq!(second.frames_written, first.frames_written);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_size_rotation_keeps_frame_whole() {
        let dir = tempfile::tempdir().unwrap();
        let bus = FrameBus::new();

        // Each frame is ~104 bytes; rotate once 100 bytes are on disk
        let session = RecordingSession::start(
            &bus,
            PixelFormat::Mjpeg,
            options(
                dir.path(),
                RotationPolicy {
                    max_duration_s: 0,
                    max_size_bytes: 100,
                },
            ),
        )
        .unwrap();

        for seq in 0..3 {
            bus.publish(jpeg_frame(seq, 100));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let status = session.stop().await.unwrap();
        assert_eq!(status.state, RecordingState::Finalized);

        // First frame crossed the limit inside part1; each later frame
        // triggered a rotation before being written whole.
        let part1 = std::fs::read(dir.path().join("video_20250101_120000_part1.mjpeg")).unwrap();
        assert_eq!(&part1[..2], &[0xFF, 0xD8]);
        assert_eq!(&part1[part1.len() - 2..], &[0xFF, 0xD9]);
        assert_eq!(part1.len(), 104);

        let part2 = std::fs::read(dir.path().join("video_20250101_120000_part2.mjpeg")).unwrap();
        assert_eq!(part2.len(), 104);

        let part3 = std::fs::read(dir.path().join("video_20250101_120000_part3.mjpeg")).unwrap();
        assert_eq!(part3.len(), 104);
        assert_eq!(status.segment_index, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_capture_close_finalizes_recording() {
        let dir = tempfile::tempdir().unwrap();
        let bus = FrameBus::new();

        let session = RecordingSession::start(
            &bus,
            PixelFormat::Mjpeg,
            options(dir.path(), RotationPolicy::default()),
        )
        .unwrap();

        bus.publish(jpeg_frame(0, 64));
        bus.publish_closed();

        // Worker sees the sentinel and finalizes on its own
        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = session.status();
        assert_eq!(status.state, RecordingState::Finalized);
        assert_eq!(status.frames_written, 1);
    }

    #[tokio::test]
    async fn test_non_mjpeg_source_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bus = FrameBus::new();

        let result = RecordingSession::start(
            &bus,
            PixelFormat::Yuyv,
            options(dir.path(), RotationPolicy::default()),
        );
        assert!(matches!(result, Err(AppError::UnsupportedFormat(_))));
        // Nothing was registered on the bus
        assert_eq!(bus.subscriber_count(), 0);
    }
}
