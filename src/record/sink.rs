//! Container sinks for the recorder
//!
//! The MJPEG sink appends each frame payload verbatim, preserving
//! SOI/EOI markers, so a recording is a plain concatenation of JPEG
//! images. Other containers plug in behind [`RecordSink`] by delegating
//! to an external codec.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::Result;
use crate::video::frame::Frame;

/// One open recording segment
pub trait RecordSink: Send {
    /// Append a frame; returns bytes written
    fn write_frame(&mut self, frame: &Frame) -> Result<u64>;

    /// Flush buffered data to the file
    fn flush(&mut self) -> Result<()>;
}

/// Verbatim MJPEG container sink
pub struct MjpegSink {
    writer: BufWriter<File>,
}

impl MjpegSink {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::create(path.as_ref())?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl RecordSink for MjpegSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<u64> {
        let data = frame.data();
        self.writer.write_all(data)?;
        Ok(data.len() as u64)
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::format::{PixelFormat, Resolution};
    use bytes::Bytes;

    fn jpeg_frame(sequence: u64) -> Frame {
        let mut data = vec![0xFF, 0xD8];
        data.extend(vec![sequence as u8; 64]);
        data.extend([0xFF, 0xD9]);
        Frame::from_bytes(
            Bytes::from(data),
            Resolution::VGA,
            PixelFormat::Mjpeg,
            sequence,
        )
    }

    #[test]
    fn test_mjpeg_sink_writes_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mjpeg.tmp");

        let mut sink = MjpegSink::create(&path).unwrap();
        let frame = jpeg_frame(0);
        let written = sink.write_frame(&frame).unwrap();
        sink.flush().unwrap();

        assert_eq!(written, frame.len() as u64);
        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(&on_disk[..], frame.data());
    }

    #[test]
    fn test_mjpeg_sink_concatenates_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mjpeg.tmp");

        let mut sink = MjpegSink::create(&path).unwrap();
        for seq in 0..3 {
            sink.write_frame(&jpeg_frame(seq)).unwrap();
        }
        sink.flush().unwrap();

        let on_disk = std::fs::read(&path).unwrap();
        // Starts with SOI, ends with EOI, three SOI markers total
        assert_eq!(&on_disk[..2], &[0xFF, 0xD8]);
        assert_eq!(&on_disk[on_disk.len() - 2..], &[0xFF, 0xD9]);
        let soi_count = on_disk.windows(2).filter(|w| w == &[0xFF, 0xD8]).count();
        assert_eq!(soi_count, 3);
    }
}
