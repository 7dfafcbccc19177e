//! Per-client stream pipeline
//!
//! Each connected client owns exactly one bus subscriber (newest-wins,
//! capacity 2) and pulls frames through three gates: rate limit, then
//! encode (pass-through for JPEG input), then transmit. The transport
//! layer (HTTP multipart or WS binary) lives in the web handlers.

use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::Result;
use crate::video::bus::{BusEvent, DropPolicy, FrameBus, SubscriberHandle, SubscriberKind};
use crate::video::encoder::{to_jpeg, JpegEncode};
use crate::video::format::Resolution;

/// Stream subscriber inbox depth
const STREAM_INBOX: usize = 2;

/// Client-requested stream parameters
#[derive(Debug, Clone)]
pub struct StreamParams {
    /// JPEG quality (1-100)
    pub quality: u8,
    /// Frame rate ceiling (1-60)
    pub max_fps: u32,
    /// Optional output size; None = source size
    pub target_size: Option<Resolution>,
}

impl StreamParams {
    pub fn new(quality: u8, max_fps: u32, target_size: Option<Resolution>) -> Self {
        Self {
            quality: quality.clamp(1, 100),
            max_fps: max_fps.clamp(1, 60),
            target_size,
        }
    }

    fn min_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.max_fps as f64)
    }
}

/// One client's view of the frame stream
pub struct StreamSession {
    subscriber: SubscriberHandle,
    params: StreamParams,
    encoder: Box<dyn JpegEncode>,
    min_interval: Duration,
    last_sent: Option<Instant>,
}

impl StreamSession {
    /// Register this session's bus subscriber
    pub fn subscribe(
        bus: &Arc<FrameBus>,
        params: StreamParams,
        encoder: Box<dyn JpegEncode>,
    ) -> Result<Self> {
        let subscriber = bus.subscribe(
            SubscriberKind::Stream,
            STREAM_INBOX,
            DropPolicy::NewestWins,
        )?;
        let min_interval = params.min_interval();
        Ok(Self {
            subscriber,
            params,
            encoder,
            min_interval,
            last_sent: None,
        })
    }

    pub fn params(&self) -> &StreamParams {
        &self.params
    }

    /// Frames dropped on this session's inbox
    pub fn dropped(&self) -> u64 {
        self.subscriber.dropped()
    }

    /// Pull the next frame that passes the rate and encode gates.
    /// Returns None once the capture session has ended or the frame
    /// format cannot be delivered as JPEG.
    pub async fn next_jpeg(&mut self) -> Option<Bytes> {
        loop {
            match self.subscriber.recv().await {
                BusEvent::Frame(frame) => {
                    // Rate gate: drop frames arriving faster than the ceiling
                    if let Some(last) = self.last_sent {
                        if last.elapsed() < self.min_interval {
                            continue;
                        }
                    }

                    // Encode gate: pass-through for JPEG input
                    if !frame.is_jpeg() && !self.encoder.supports(frame.format) {
                        warn!(
                            "Stream cannot deliver {} frames as JPEG, closing session",
                            frame.format
                        );
                        return None;
                    }
                    let jpeg = match to_jpeg(self.encoder.as_mut(), &frame, self.params.quality) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            debug!("Frame {} encode failed: {}", frame.sequence, e);
                            continue;
                        }
                    };

                    self.last_sent = Some(Instant::now());
                    return Some(jpeg);
                }
                BusEvent::Closed => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::encoder::testing::FakeEncoder;
    use crate::video::format::PixelFormat;
    use crate::video::frame::Frame;

    fn jpeg_frame(sequence: u64) -> Frame {
        let mut data = vec![0xFF, 0xD8];
        data.extend(vec![sequence as u8; 200]);
        data.extend([0xFF, 0xD9]);
        Frame::from_bytes(
            Bytes::from(data),
            Resolution::VGA,
            PixelFormat::Mjpeg,
            sequence,
        )
    }

    #[tokio::test]
    async fn test_passthrough_delivery() {
        let bus = FrameBus::new();
        let mut session = StreamSession::subscribe(
            &bus,
            StreamParams::new(80, 30, None),
            Box::new(FakeEncoder),
        )
        .unwrap();

        let frame = jpeg_frame(0);
        bus.publish(frame.clone());
        bus.publish_closed();

        let jpeg = session.next_jpeg().await.unwrap();
        assert_eq!(&jpeg[..], frame.data());
        assert!(session.next_jpeg().await.is_none());
    }

    #[tokio::test]
    async fn test_rate_gate_drops_fast_frames() {
        let bus = FrameBus::new();
        // 1 fps ceiling: only the first of a burst may pass
        let mut session = StreamSession::subscribe(
            &bus,
            StreamParams::new(80, 1, None),
            Box::new(FakeEncoder),
        )
        .unwrap();

        bus.publish(jpeg_frame(0));
        let first = session.next_jpeg().await;
        assert!(first.is_some());

        bus.publish(jpeg_frame(1));
        bus.publish(jpeg_frame(2));
        bus.publish_closed();

        // Both burst frames fall to the rate gate; next event is the close
        assert!(session.next_jpeg().await.is_none());
    }

    #[tokio::test]
    async fn test_raw_frames_are_encoded() {
        let bus = FrameBus::new();
        let mut session = StreamSession::subscribe(
            &bus,
            StreamParams::new(80, 30, None),
            Box::new(FakeEncoder),
        )
        .unwrap();

        bus.publish(Frame::from_bytes(
            Bytes::from(vec![7u8; 640 * 480 * 2]),
            Resolution::VGA,
            PixelFormat::Yuyv,
            0,
        ));

        let jpeg = session.next_jpeg().await.unwrap();
        assert!(Frame::is_valid_jpeg_bytes(&jpeg));
    }

    #[tokio::test]
    async fn test_undeliverable_format_closes_session() {
        let bus = FrameBus::new();
        let mut session = StreamSession::subscribe(
            &bus,
            StreamParams::new(80, 30, None),
            Box::new(FakeEncoder),
        )
        .unwrap();

        // H264 cannot be re-encoded to JPEG in this pipeline
        bus.publish(Frame::from_bytes(
            Bytes::from(vec![0u8; 4096]),
            Resolution::VGA,
            PixelFormat::H264,
            0,
        ));

        assert!(session.next_jpeg().await.is_none());
    }

    #[test]
    fn test_params_clamping() {
        let params = StreamParams::new(255, 600, None);
        assert_eq!(params.quality, 100);
        assert_eq!(params.max_fps, 60);

        let params = StreamParams::new(0, 0, None);
        assert_eq!(params.quality, 1);
        assert_eq!(params.max_fps, 1);
    }
}
