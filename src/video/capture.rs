//! V4L2 capture source
//!
//! Owns the device fd, the mmap buffer pool and the blocking capture
//! loop. The loop is the only code that touches the device once capture
//! starts; everything downstream sees frames through the [`FrameBus`].

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use v4l::buffer::Type as BufferType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::Format;

use super::bus::FrameBus;
use super::format::{PixelFormat, Resolution};
use super::frame::{Frame, FrameBuffer, FrameBufferPool};
use crate::error::{AppError, Result};

/// Number of mmap capture buffers
pub const BUFFER_COUNT: u32 = 4;
/// Bound on waiting for the capture loop to exit
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);
/// Dequeue deadline; on expiry the loop re-checks the stop flag
const DEQUEUE_DEADLINE: Duration = Duration::from_secs(1);
/// A buffer unreturned for this long is reported as leaked
const BUFFER_LEAK_GRACE: Duration = Duration::from_secs(1);

/// Capture configuration (requested values)
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub device_path: PathBuf,
    pub resolution: Resolution,
    pub format: PixelFormat,
    pub fps: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from("/dev/video0"),
            resolution: Resolution::HD720,
            format: PixelFormat::Mjpeg,
            fps: 30,
        }
    }
}

/// Parameters the driver actually granted (may differ from requested)
#[derive(Debug, Clone, Copy)]
pub struct GrantedParams {
    pub resolution: Resolution,
    pub format: PixelFormat,
    pub fps: u32,
}

/// Capture session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// Device open, not capturing
    Ready,
    /// Capture loop running
    Capturing,
    /// Fatal device error; sticky until close
    Failed,
}

/// Session counters read by status snapshots
#[derive(Debug, Default)]
pub struct CaptureCounters {
    pub frames_captured: AtomicU64,
    pub frames_discarded: AtomicU64,
    pub io_errors: AtomicU64,
}

/// One open V4L2 device with its buffer pool and capture loop.
///
/// At most one session exists per process; the capture controller owns it
/// exclusively.
pub struct CaptureSession {
    config: CaptureConfig,
    granted: GrantedParams,
    device: Arc<Device>,
    bus: Arc<FrameBus>,
    pool: Arc<FrameBufferPool>,
    stop_flag: Arc<AtomicBool>,
    state_tx: Arc<watch::Sender<CaptureState>>,
    state_rx: watch::Receiver<CaptureState>,
    counters: Arc<CaptureCounters>,
    last_error: Arc<parking_lot::RwLock<Option<String>>>,
    capture_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    generation: u64,
}

impl CaptureSession {
    /// Open the device and negotiate format.
    ///
    /// Tries the requested format first, then MJPEG, then YUYV, and records
    /// whatever the driver actually granted. Blocking; call from a blocking
    /// context.
    pub fn open(config: CaptureConfig, bus: Arc<FrameBus>, generation: u64) -> Result<Self> {
        info!(
            "Opening {} at {} {} {}fps",
            config.device_path.display(),
            config.resolution,
            config.format,
            config.fps
        );

        let device = Device::with_path(&config.device_path)
            .map_err(|e| map_open_error(&config.device_path, e))?;

        let granted = negotiate_format(&device, &config)?;
        info!(
            "Granted {} {} {}fps",
            granted.resolution, granted.format, granted.fps
        );

        let pool = Arc::new(FrameBufferPool::new(BUFFER_COUNT as usize + 4));
        for _ in 0..BUFFER_COUNT {
            pool.put(Vec::new());
        }

        let (state_tx, state_rx) = watch::channel(CaptureState::Ready);

        Ok(Self {
            config,
            granted,
            device: Arc::new(device),
            bus,
            pool,
            stop_flag: Arc::new(AtomicBool::new(false)),
            state_tx: Arc::new(state_tx),
            state_rx,
            counters: Arc::new(CaptureCounters::default()),
            last_error: Arc::new(parking_lot::RwLock::new(None)),
            capture_handle: Mutex::new(None),
            generation,
        })
    }

    pub fn state(&self) -> CaptureState {
        *self.state_rx.borrow()
    }

    /// Subscribe to state transitions
    pub fn state_watch(&self) -> watch::Receiver<CaptureState> {
        self.state_rx.clone()
    }

    /// Shared handle to the sticky capture error
    pub fn error_handle(&self) -> Arc<parking_lot::RwLock<Option<String>>> {
        self.last_error.clone()
    }

    pub fn is_capturing(&self) -> bool {
        self.state() == CaptureState::Capturing
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn granted(&self) -> GrantedParams {
        self.granted
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn counters(&self) -> &CaptureCounters {
        &self.counters
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Start the capture loop
    pub async fn start(&self) -> Result<()> {
        match self.state() {
            CaptureState::Capturing => return Ok(()),
            CaptureState::Failed => {
                return Err(AppError::State(
                    "Capture session failed; close the device first".to_string(),
                ))
            }
            CaptureState::Ready => {}
        }

        self.stop_flag.store(false, Ordering::SeqCst);

        let device = self.device.clone();
        let bus = self.bus.clone();
        let pool = self.pool.clone();
        let stop_flag = self.stop_flag.clone();
        let state_tx = self.state_tx.clone();
        let counters = self.counters.clone();
        let last_error = self.last_error.clone();
        let granted = self.granted;

        let handle = tokio::task::spawn_blocking(move || {
            let _ = state_tx.send(CaptureState::Capturing);
            let result = run_capture_loop(&device, granted, &bus, &pool, &stop_flag, &counters);

            match result {
                Ok(()) => {
                    info!("Capture stopped");
                    let _ = state_tx.send(CaptureState::Ready);
                }
                Err(e) => {
                    error!("Capture failed: {}", e);
                    *last_error.write() = Some(e.to_string());
                    let _ = state_tx.send(CaptureState::Failed);
                }
            }
            // Whichever way the loop ended, downstream consumers are done
            bus.publish_closed();
        });

        *self.capture_handle.lock().await = Some(handle);
        Ok(())
    }

    /// Stop the capture loop, waiting up to [`STOP_TIMEOUT`]
    pub async fn stop(&self) -> Result<()> {
        self.stop_flag.store(true, Ordering::SeqCst);

        if let Some(handle) = self.capture_handle.lock().await.take() {
            match tokio::time::timeout(STOP_TIMEOUT, handle).await {
                Ok(_) => {}
                Err(_) => {
                    // Detached; the device closes when the loop finally drops
                    // its reference.
                    warn!("Capture loop did not exit within {:?}", STOP_TIMEOUT);
                    return Err(AppError::Timeout("capture loop shutdown".to_string()));
                }
            }
        }
        Ok(())
    }

    /// Stop if needed and release the device
    pub async fn close(self) -> Result<()> {
        let stop_result = self.stop().await;
        drop(self.device);
        info!("Capture session closed");
        stop_result
    }
}

fn map_open_error(path: &std::path::Path, e: io::Error) -> AppError {
    match e.raw_os_error() {
        Some(libc::EBUSY) => AppError::DeviceBusy(path.display().to_string()),
        Some(libc::ENOENT) | Some(libc::ENODEV) | Some(libc::ENXIO) => {
            AppError::DeviceNotFound(path.display().to_string())
        }
        _ => AppError::Io(e),
    }
}

/// Negotiate pixel format, resolution and frame interval with the driver
fn negotiate_format(device: &Device, config: &CaptureConfig) -> Result<GrantedParams> {
    let mut granted: Option<(Resolution, PixelFormat)> = None;

    for candidate in PixelFormat::negotiation_order(config.format) {
        let requested = Format::new(
            config.resolution.width,
            config.resolution.height,
            candidate.to_fourcc(),
        );
        let actual = match device.set_format(&requested) {
            Ok(f) => f,
            Err(e) => {
                debug!("set_format {} failed: {}", candidate, e);
                continue;
            }
        };
        if PixelFormat::from_fourcc(actual.fourcc) == Some(candidate) {
            if actual.width != config.resolution.width
                || actual.height != config.resolution.height
            {
                warn!(
                    "Requested {}, driver granted {}x{}",
                    config.resolution, actual.width, actual.height
                );
            }
            granted = Some((Resolution::new(actual.width, actual.height), candidate));
            break;
        }
    }

    let (resolution, format) = granted.ok_or_else(|| {
        AppError::UnsupportedFormat(format!(
            "{} supports none of the negotiable formats",
            config.device_path.display()
        ))
    })?;

    // Frame interval is best effort; drivers may coerce or refuse
    let mut fps = config.fps;
    if config.fps > 0 {
        match device.set_params(&Parameters::with_fps(config.fps)) {
            Ok(params) if params.interval.numerator > 0 => {
                let actual_fps = params.interval.denominator / params.interval.numerator;
                if actual_fps > 0 && actual_fps != config.fps {
                    info!("Frame rate coerced: requested {} got {}", config.fps, actual_fps);
                    fps = actual_fps;
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to set frame interval: {}", e),
        }
    }

    Ok(GrantedParams {
        resolution,
        format,
        fps,
    })
}

/// The blocking DQBUF/QBUF loop.
///
/// Dequeues one buffer at a time, copies the payload into a pooled
/// buffer and publishes it. Requeueing happens implicitly on the next
/// dequeue; a published frame pins its pooled buffer until every
/// subscriber releases it.
fn run_capture_loop(
    device: &Device,
    granted: GrantedParams,
    bus: &FrameBus,
    pool: &Arc<FrameBufferPool>,
    stop_flag: &AtomicBool,
    counters: &CaptureCounters,
) -> Result<()> {
    let mut stream = MmapStream::with_buffers(device, BufferType::VideoCapture, BUFFER_COUNT)
        .map_err(AppError::Io)?;
    stream.set_timeout(DEQUEUE_DEADLINE);

    info!("Capture loop running");

    let mut sequence: u64 = 0;
    let mut dequeues: u64 = 0;
    let mut pool_empty_since: Option<Instant> = None;
    let mut leak_reported = false;

    while !stop_flag.load(Ordering::Relaxed) {
        let (buf, meta) = match stream.next() {
            Ok(frame_data) => frame_data,
            Err(e) => {
                if e.kind() == io::ErrorKind::TimedOut {
                    // Deadline tick: re-check the stop flag and wait again
                    debug!("Dequeue deadline expired, no signal?");
                    continue;
                }
                match e.raw_os_error() {
                    Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
                    Some(libc::ENODEV) | Some(libc::ENXIO) | Some(libc::EIO)
                    | Some(libc::EPIPE) | Some(libc::ESHUTDOWN) => {
                        error!("Video device lost: {}", e);
                        counters.io_errors.fetch_add(1, Ordering::Relaxed);
                        return Err(AppError::Io(e));
                    }
                    _ => {
                        error!("Dequeue failed: {}", e);
                        counters.io_errors.fetch_add(1, Ordering::Relaxed);
                        return Err(AppError::Io(e));
                    }
                }
            }
        };

        let buffer_index = (dequeues % BUFFER_COUNT as u64) as u32;
        dequeues += 1;

        let frame_size = meta.bytesused as usize;
        if frame_size == 0 {
            counters.frames_discarded.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        if granted.format.is_jpeg() && !Frame::is_valid_jpeg_bytes(&buf[..frame_size]) {
            debug!("Discarding malformed JPEG frame ({} bytes)", frame_size);
            counters.frames_discarded.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        // Leak watch: all pooled buffers held downstream for too long
        if pool.idle() == 0 {
            let since = pool_empty_since.get_or_insert_with(Instant::now);
            if !leak_reported && since.elapsed() > BUFFER_LEAK_GRACE {
                warn!(
                    "Frame buffers held past {:?} grace period; continuing with fresh allocations",
                    BUFFER_LEAK_GRACE
                );
                leak_reported = true;
            }
        } else {
            pool_empty_since = None;
            leak_reported = false;
        }

        let mut owned = pool.take(frame_size);
        owned.resize(frame_size, 0);
        owned[..frame_size].copy_from_slice(&buf[..frame_size]);

        let frame = Frame::from_pooled(
            Arc::new(FrameBuffer::new(owned, Some(pool.clone()))),
            granted.resolution,
            granted.format,
            sequence,
            buffer_index,
        );
        sequence += 1;

        bus.publish(frame);
        counters.frames_captured.fetch_add(1, Ordering::Relaxed);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_error_mapping() {
        let path = std::path::Path::new("/dev/video9");
        assert!(matches!(
            map_open_error(path, io::Error::from_raw_os_error(libc::EBUSY)),
            AppError::DeviceBusy(_)
        ));
        assert!(matches!(
            map_open_error(path, io::Error::from_raw_os_error(libc::ENOENT)),
            AppError::DeviceNotFound(_)
        ));
        assert!(matches!(
            map_open_error(path, io::Error::from_raw_os_error(libc::EACCES)),
            AppError::Io(_)
        ));
    }

    #[test]
    fn test_default_config() {
        let config = CaptureConfig::default();
        assert_eq!(config.format, PixelFormat::Mjpeg);
        assert_eq!(config.fps, 30);
        assert_eq!(config.resolution, Resolution::HD720);
    }
}
