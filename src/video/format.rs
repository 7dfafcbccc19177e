//! Pixel format definitions and conversions

use serde::{Deserialize, Serialize};
use std::fmt;
use v4l::format::fourcc::FourCC;

/// Supported pixel formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    /// MJPEG compressed format (preferred for capture cards)
    Mjpeg,
    /// YUYV 4:2:2 packed format
    Yuyv,
    /// NV12 semi-planar format (Y plane + interleaved UV)
    Nv12,
    /// RGB24 format (3 bytes per pixel)
    Rgb24,
    /// BGR24 format (3 bytes per pixel)
    Bgr24,
    /// H.264 compressed bitstream
    H264,
}

impl PixelFormat {
    /// Convert to V4L2 FourCC
    pub fn to_fourcc(&self) -> FourCC {
        match self {
            PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
            PixelFormat::Yuyv => FourCC::new(b"YUYV"),
            PixelFormat::Nv12 => FourCC::new(b"NV12"),
            PixelFormat::Rgb24 => FourCC::new(b"RGB3"),
            PixelFormat::Bgr24 => FourCC::new(b"BGR3"),
            PixelFormat::H264 => FourCC::new(b"H264"),
        }
    }

    /// Try to convert from V4L2 FourCC
    pub fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"MJPG" | b"JPEG" => Some(PixelFormat::Mjpeg),
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"NV12" => Some(PixelFormat::Nv12),
            b"RGB3" => Some(PixelFormat::Rgb24),
            b"BGR3" => Some(PixelFormat::Bgr24),
            b"H264" => Some(PixelFormat::H264),
            _ => None,
        }
    }

    /// Check if format is compressed (MJPEG/H264)
    pub fn is_compressed(&self) -> bool {
        matches!(self, PixelFormat::Mjpeg | PixelFormat::H264)
    }

    /// Check if a frame in this format is a self-contained JPEG image
    pub fn is_jpeg(&self) -> bool {
        matches!(self, PixelFormat::Mjpeg)
    }

    /// Calculate expected frame size for a given resolution
    /// Returns None for compressed formats (variable size)
    pub fn frame_size(&self, resolution: Resolution) -> Option<usize> {
        let pixels = (resolution.width * resolution.height) as usize;
        match self {
            PixelFormat::Mjpeg | PixelFormat::H264 => None,
            PixelFormat::Yuyv => Some(pixels * 2),
            PixelFormat::Nv12 => Some(pixels * 3 / 2),
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(pixels * 3),
        }
    }

    /// Format negotiation order: the requested format first, then MJPEG,
    /// then YUYV as the last resort.
    pub fn negotiation_order(preferred: PixelFormat) -> Vec<PixelFormat> {
        let mut order = vec![preferred];
        for fallback in [PixelFormat::Mjpeg, PixelFormat::Yuyv] {
            if !order.contains(&fallback) {
                order.push(fallback);
            }
        }
        order
    }

    /// Get all supported formats
    pub fn all() -> &'static [PixelFormat] {
        &[
            PixelFormat::Mjpeg,
            PixelFormat::Yuyv,
            PixelFormat::Nv12,
            PixelFormat::Rgb24,
            PixelFormat::Bgr24,
            PixelFormat::H264,
        ]
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Mjpeg => "MJPEG",
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Nv12 => "NV12",
            PixelFormat::Rgb24 => "RGB24",
            PixelFormat::Bgr24 => "BGR24",
            PixelFormat::H264 => "H264",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "MJPEG" | "MJPG" | "JPEG" => Ok(PixelFormat::Mjpeg),
            "YUYV" => Ok(PixelFormat::Yuyv),
            "NV12" => Ok(PixelFormat::Nv12),
            "RGB24" => Ok(PixelFormat::Rgb24),
            "BGR24" => Ok(PixelFormat::Bgr24),
            "H264" => Ok(PixelFormat::H264),
            _ => Err(format!("Unknown pixel format: {}", s)),
        }
    }
}

/// Resolution (width x height)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Check if resolution is valid
    pub fn is_valid(&self) -> bool {
        self.width >= 160 && self.width <= 7680 && self.height >= 120 && self.height <= 4320
    }

    /// Get total pixels
    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Common resolutions
    pub const VGA: Resolution = Resolution {
        width: 640,
        height: 480,
    };
    pub const HD720: Resolution = Resolution {
        width: 1280,
        height: 720,
    };
    pub const HD1080: Resolution = Resolution {
        width: 1920,
        height: 1080,
    };
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_roundtrip() {
        for format in PixelFormat::all() {
            assert_eq!(PixelFormat::from_fourcc(format.to_fourcc()), Some(*format));
        }
    }

    #[test]
    fn test_negotiation_order() {
        assert_eq!(
            PixelFormat::negotiation_order(PixelFormat::Nv12),
            vec![PixelFormat::Nv12, PixelFormat::Mjpeg, PixelFormat::Yuyv]
        );
        assert_eq!(
            PixelFormat::negotiation_order(PixelFormat::Mjpeg),
            vec![PixelFormat::Mjpeg, PixelFormat::Yuyv]
        );
        assert_eq!(
            PixelFormat::negotiation_order(PixelFormat::Yuyv),
            vec![PixelFormat::Yuyv, PixelFormat::Mjpeg]
        );
    }

    #[test]
    fn test_frame_size() {
        let vga = Resolution::VGA;
        assert_eq!(PixelFormat::Yuyv.frame_size(vga), Some(640 * 480 * 2));
        assert_eq!(PixelFormat::Nv12.frame_size(vga), Some(640 * 480 * 3 / 2));
        assert_eq!(PixelFormat::Rgb24.frame_size(vga), Some(640 * 480 * 3));
        assert_eq!(PixelFormat::Mjpeg.frame_size(vga), None);
    }

    #[test]
    fn test_parse() {
        assert_eq!("mjpg".parse::<PixelFormat>(), Ok(PixelFormat::Mjpeg));
        assert_eq!("YUYV".parse::<PixelFormat>(), Ok(PixelFormat::Yuyv));
        assert!("BOGUS".parse::<PixelFormat>().is_err());
    }
}
