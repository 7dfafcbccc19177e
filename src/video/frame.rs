//! Video frame data structures
//!
//! A [`Frame`] is immutable after publication. Its payload lives in a
//! pooled buffer whose final drop returns the allocation to the capture
//! source's [`FrameBufferPool`] (the release hook), so holding a frame
//! keeps its buffer out of circulation.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use super::format::{PixelFormat, Resolution};

/// Bounded pool of reusable payload buffers.
///
/// The capture loop draws from the pool for each dequeued kernel buffer;
/// consumers return buffers implicitly when the last `Frame` clone drops.
#[derive(Debug)]
pub struct FrameBufferPool {
    pool: Mutex<Vec<Vec<u8>>>,
    max_buffers: usize,
}

impl FrameBufferPool {
    pub fn new(max_buffers: usize) -> Self {
        Self {
            pool: Mutex::new(Vec::new()),
            max_buffers: max_buffers.max(1),
        }
    }

    pub fn take(&self, min_capacity: usize) -> Vec<u8> {
        let mut pool = self.pool.lock();
        if let Some(mut buf) = pool.pop() {
            if buf.capacity() < min_capacity {
                buf.reserve(min_capacity - buf.capacity());
            }
            buf
        } else {
            Vec::with_capacity(min_capacity)
        }
    }

    pub fn put(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut pool = self.pool.lock();
        if pool.len() < self.max_buffers {
            pool.push(buf);
        }
    }

    /// Number of buffers currently idle in the pool
    pub fn idle(&self) -> usize {
        self.pool.lock().len()
    }
}

/// A payload buffer with a pool release hook.
pub struct FrameBuffer {
    data: Vec<u8>,
    pool: Option<Arc<FrameBufferPool>>,
}

impl FrameBuffer {
    pub fn new(data: Vec<u8>, pool: Option<Arc<FrameBufferPool>>) -> Self {
        Self { data, pool }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("len", &self.data.len())
            .finish()
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            let data = std::mem::take(&mut self.data);
            pool.put(data);
        }
    }
}

#[derive(Clone)]
enum FrameData {
    Bytes(Bytes),
    Pooled(Arc<FrameBuffer>),
}

impl std::fmt::Debug for FrameData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameData::Bytes(bytes) => f
                .debug_struct("FrameData::Bytes")
                .field("len", &bytes.len())
                .finish(),
            FrameData::Pooled(buf) => f
                .debug_struct("FrameData::Pooled")
                .field("len", &buf.len())
                .finish(),
        }
    }
}

/// A captured video frame with metadata
#[derive(Debug, Clone)]
pub struct Frame {
    /// Raw frame data
    data: FrameData,
    /// Frame resolution
    pub resolution: Resolution,
    /// Pixel format
    pub format: PixelFormat,
    /// Sequence number (strictly increasing per capture session)
    pub sequence: u64,
    /// Kernel buffer index this frame was dequeued from
    pub buffer_index: u32,
    /// Monotonic capture timestamp
    pub captured_at: Instant,
    /// Wall-clock capture timestamp (microseconds since epoch)
    pub wall_clock_us: u64,
}

impl Frame {
    /// Create a frame from a pooled buffer
    pub fn from_pooled(
        data: Arc<FrameBuffer>,
        resolution: Resolution,
        format: PixelFormat,
        sequence: u64,
        buffer_index: u32,
    ) -> Self {
        Self {
            data: FrameData::Pooled(data),
            resolution,
            format,
            sequence,
            buffer_index,
            captured_at: Instant::now(),
            wall_clock_us: wall_clock_us_now(),
        }
    }

    /// Create a frame from owned bytes (encoded output, tests)
    pub fn from_bytes(
        data: Bytes,
        resolution: Resolution,
        format: PixelFormat,
        sequence: u64,
    ) -> Self {
        Self {
            data: FrameData::Bytes(data),
            resolution,
            format,
            sequence,
            buffer_index: 0,
            captured_at: Instant::now(),
            wall_clock_us: wall_clock_us_now(),
        }
    }

    /// Get frame data as a byte slice
    pub fn data(&self) -> &[u8] {
        match &self.data {
            FrameData::Bytes(bytes) => bytes,
            FrameData::Pooled(buf) => buf.as_slice(),
        }
    }

    /// Get frame data as `Bytes` (cheap clone for `Bytes`-backed frames)
    pub fn data_bytes(&self) -> Bytes {
        match &self.data {
            FrameData::Bytes(bytes) => bytes.clone(),
            FrameData::Pooled(buf) => Bytes::copy_from_slice(buf.as_slice()),
        }
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }

    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.resolution.height
    }

    /// Time since capture
    pub fn age(&self) -> std::time::Duration {
        self.captured_at.elapsed()
    }

    /// Check whether this frame is a self-contained JPEG image
    pub fn is_jpeg(&self) -> bool {
        self.format.is_jpeg()
    }

    /// Validate JPEG frame data
    pub fn is_valid_jpeg(&self) -> bool {
        self.is_jpeg() && Self::is_valid_jpeg_bytes(self.data())
    }

    /// Validate JPEG bytes without constructing a frame
    pub fn is_valid_jpeg_bytes(data: &[u8]) -> bool {
        if data.len() < 125 {
            return false;
        }
        let start_marker = ((data[0] as u16) << 8) | data[1] as u16;
        if start_marker != 0xFFD8 {
            return false;
        }
        let end = data.len();
        let end_marker = ((data[end - 2] as u16) << 8) | data[end - 1] as u16;
        // Some capture cards pad the tail with zeros after EOI
        matches!(end_marker, 0xFFD9 | 0xD900 | 0x0000)
    }
}

fn wall_clock_us_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Frame metadata without the payload (for logging/status)
#[derive(Debug, Clone)]
pub struct FrameMeta {
    pub resolution: Resolution,
    pub format: PixelFormat,
    pub size: usize,
    pub sequence: u64,
}

impl From<&Frame> for FrameMeta {
    fn from(frame: &Frame) -> Self {
        Self {
            resolution: frame.resolution,
            format: frame.format,
            size: frame.len(),
            sequence: frame.sequence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg_payload() -> Vec<u8> {
        let mut data = vec![0xFF, 0xD8];
        data.extend(vec![0u8; 200]);
        data.extend([0xFF, 0xD9]);
        data
    }

    #[test]
    fn test_valid_jpeg_markers() {
        assert!(Frame::is_valid_jpeg_bytes(&jpeg_payload()));
        assert!(!Frame::is_valid_jpeg_bytes(&[0xFF, 0xD8, 0xFF, 0xD9]));

        let mut bad = vec![0x00, 0x00];
        bad.extend(vec![0u8; 200]);
        assert!(!Frame::is_valid_jpeg_bytes(&bad));
    }

    #[test]
    fn test_pool_release_hook() {
        let pool = Arc::new(FrameBufferPool::new(4));
        let buf = pool.take(64);
        assert_eq!(pool.idle(), 0);

        let frame = Frame::from_pooled(
            Arc::new(FrameBuffer::new(buf, Some(pool.clone()))),
            Resolution::VGA,
            PixelFormat::Mjpeg,
            0,
            0,
        );
        let clone = frame.clone();
        drop(frame);
        // A live clone keeps the buffer out of the pool
        assert_eq!(pool.idle(), 0);
        drop(clone);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_pool_is_bounded() {
        let pool = FrameBufferPool::new(2);
        pool.put(Vec::with_capacity(8));
        pool.put(Vec::with_capacity(8));
        pool.put(Vec::with_capacity(8));
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn test_frame_meta() {
        let frame = Frame::from_bytes(
            Bytes::from(jpeg_payload()),
            Resolution::VGA,
            PixelFormat::Mjpeg,
            7,
        );
        let meta = FrameMeta::from(&frame);
        assert_eq!(meta.sequence, 7);
        assert_eq!(meta.size, 204);
    }
}
