//! V4L2 device enumeration and capability query

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use v4l::capability::Flags as CapFlags;
use v4l::prelude::*;
use v4l::video::Capture;

use super::format::{PixelFormat, Resolution};
use crate::error::{AppError, Result};

/// Information about a video device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoDeviceInfo {
    /// Device path (e.g., /dev/video0)
    pub path: PathBuf,
    /// Card name from the driver
    pub name: String,
    /// Driver name
    pub driver: String,
    /// Bus info
    pub bus_info: String,
    /// Supported pixel formats with their frame sizes
    pub formats: Vec<FormatInfo>,
}

/// One supported format and its discrete frame sizes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatInfo {
    pub format: PixelFormat,
    pub description: String,
    pub resolutions: Vec<ResolutionInfo>,
}

/// A supported frame size and its frame rates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionInfo {
    pub width: u32,
    pub height: u32,
    pub fps: Vec<u32>,
}

impl ResolutionInfo {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }
}

/// Query full capability info for one device
pub fn query_device(path: impl AsRef<Path>) -> Result<VideoDeviceInfo> {
    let path = path.as_ref().to_path_buf();
    let device = Device::with_path(&path)
        .map_err(|e| AppError::DeviceNotFound(format!("{}: {}", path.display(), e)))?;

    let caps = device.query_caps().map_err(AppError::Io)?;
    if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
        return Err(AppError::UnsupportedFormat(format!(
            "{} is not a video capture device",
            path.display()
        )));
    }

    let mut formats = Vec::new();
    for desc in device.enum_formats().map_err(AppError::Io)? {
        let Some(format) = PixelFormat::from_fourcc(desc.fourcc) else {
            debug!("Skipping unsupported fourcc {} ({})", desc.fourcc, desc.description);
            continue;
        };

        let resolutions = enum_resolutions(&device, format);
        formats.push(FormatInfo {
            format,
            description: desc.description,
            resolutions,
        });
    }

    Ok(VideoDeviceInfo {
        path,
        name: caps.card.clone(),
        driver: caps.driver,
        bus_info: caps.bus,
        formats,
    })
}

fn enum_resolutions(device: &Device, format: PixelFormat) -> Vec<ResolutionInfo> {
    let fourcc = format.to_fourcc();
    let mut resolutions = Vec::new();

    let sizes = match device.enum_framesizes(fourcc) {
        Ok(sizes) => sizes,
        Err(e) => {
            debug!("enum_framesizes {} failed: {}", format, e);
            return resolutions;
        }
    };

    for framesize in sizes {
        for discrete in framesize.size.to_discrete() {
            let fps = enum_fps(device, format, discrete.width, discrete.height);
            resolutions.push(ResolutionInfo {
                width: discrete.width,
                height: discrete.height,
                fps,
            });
        }
    }

    resolutions.sort_by(|a, b| (b.width * b.height).cmp(&(a.width * a.height)));
    resolutions.dedup_by(|a, b| a.width == b.width && a.height == b.height);
    resolutions
}

fn enum_fps(device: &Device, format: PixelFormat, width: u32, height: u32) -> Vec<u32> {
    let mut fps_list = Vec::new();

    let intervals = match device.enum_frameintervals(format.to_fourcc(), width, height) {
        Ok(intervals) => intervals,
        Err(_) => return fps_list,
    };

    for entry in intervals {
        match entry.interval {
            v4l::frameinterval::FrameIntervalEnum::Discrete(fraction) => {
                if fraction.numerator > 0 {
                    fps_list.push(fraction.denominator / fraction.numerator);
                }
            }
            v4l::frameinterval::FrameIntervalEnum::Stepwise(step) => {
                if step.max.numerator > 0 {
                    fps_list.push(step.max.denominator / step.max.numerator);
                }
                if step.min.numerator > 0 {
                    fps_list.push(step.min.denominator / step.min.numerator);
                }
            }
        }
    }

    fps_list.sort_by(|a, b| b.cmp(a));
    fps_list.dedup();
    fps_list
}

/// Enumerate all video capture devices under /dev
pub fn enumerate_devices() -> Result<Vec<VideoDeviceInfo>> {
    let mut devices = Vec::new();

    for entry in std::fs::read_dir("/dev").map_err(AppError::Io)? {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };

        let path = entry.path();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if !name.starts_with("video") {
            continue;
        }

        match query_device(&path) {
            Ok(device_info) if !device_info.formats.is_empty() => {
                info!(
                    "Found capture device: {} ({}) - {} formats",
                    device_info.name,
                    device_info.driver,
                    device_info.formats.len()
                );
                devices.push(device_info);
            }
            Ok(_) => debug!("Skipping {} (no usable capture formats)", path.display()),
            Err(e) => debug!("Failed to probe {}: {}", path.display(), e),
        }
    }

    devices.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(devices)
}
