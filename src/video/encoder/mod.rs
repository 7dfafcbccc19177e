//! JPEG encoding behind a capability trait
//!
//! Stream sessions and photo capture go through [`JpegEncode`] so that
//! MJPEG pass-through never touches a codec and alternate encoders can be
//! swapped in for tests.

mod jpeg;

pub use jpeg::TurboJpegEncoder;

use bytes::Bytes;

use crate::error::Result;
use crate::video::format::PixelFormat;
use crate::video::frame::Frame;

/// JPEG encoding capability
pub trait JpegEncode: Send {
    fn name(&self) -> &str;

    /// Encode a raw frame to JPEG at the given quality (1-100)
    fn encode(&mut self, frame: &Frame, quality: u8) -> Result<Bytes>;

    /// Whether this encoder accepts the given input format
    fn supports(&self, format: PixelFormat) -> bool;
}

/// Produce JPEG bytes for a frame: pass-through for JPEG input, encode
/// otherwise.
pub fn to_jpeg(encoder: &mut dyn JpegEncode, frame: &Frame, quality: u8) -> Result<Bytes> {
    if frame.is_jpeg() {
        Ok(frame.data_bytes())
    } else {
        encoder.encode(frame, quality)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::error::AppError;

    /// Encoder stub that wraps payloads in JPEG markers without a codec
    pub struct FakeEncoder;

    impl JpegEncode for FakeEncoder {
        fn name(&self) -> &str {
            "fake"
        }

        fn encode(&mut self, frame: &Frame, _quality: u8) -> Result<Bytes> {
            if !self.supports(frame.format) {
                return Err(AppError::Encoding(format!(
                    "unsupported input format {}",
                    frame.format
                )));
            }
            let mut out = vec![0xFF, 0xD8];
            out.extend_from_slice(&[0u8; 128]);
            out.extend_from_slice(frame.data());
            out.extend_from_slice(&[0xFF, 0xD9]);
            Ok(Bytes::from(out))
        }

        fn supports(&self, format: PixelFormat) -> bool {
            !format.is_compressed()
        }
    }
}
