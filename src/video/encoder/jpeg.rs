//! JPEG encoder implementation (libjpeg-turbo)
//!
//! Raw frames are converted to I420 and handed to turbojpeg's YUV
//! compressor; RGB/BGR input goes straight through turbojpeg's pixel
//! formats without an intermediate plane split.
//!
//! Note: a `Compressor` is not thread-safe; each session owns its encoder.

use bytes::Bytes;

use super::JpegEncode;
use crate::error::{AppError, Result};
use crate::video::format::{PixelFormat, Resolution};
use crate::video::frame::Frame;

pub struct TurboJpegEncoder {
    compressor: turbojpeg::Compressor,
    quality: u8,
    /// Scratch buffer for I420 planes (Y + U + V)
    i420: Vec<u8>,
}

impl TurboJpegEncoder {
    pub fn new(quality: u8) -> Result<Self> {
        let mut compressor = turbojpeg::Compressor::new()
            .map_err(|e| AppError::Encoding(format!("compressor init failed: {}", e)))?;
        compressor
            .set_quality(quality.clamp(1, 100) as i32)
            .map_err(|e| AppError::Encoding(format!("set_quality failed: {}", e)))?;
        compressor
            .set_subsamp(turbojpeg::Subsamp::Sub2x2)
            .map_err(|e| AppError::Encoding(format!("set_subsamp failed: {}", e)))?;

        Ok(Self {
            compressor,
            quality: quality.clamp(1, 100),
            i420: Vec::new(),
        })
    }

    fn set_quality(&mut self, quality: u8) -> Result<()> {
        let quality = quality.clamp(1, 100);
        if quality != self.quality {
            self.compressor
                .set_quality(quality as i32)
                .map_err(|e| AppError::Encoding(format!("set_quality failed: {}", e)))?;
            self.quality = quality;
        }
        Ok(())
    }

    fn encode_i420(&mut self, resolution: Resolution) -> Result<Bytes> {
        let yuv = turbojpeg::YuvImage {
            pixels: self.i420.as_slice(),
            width: resolution.width as usize,
            height: resolution.height as usize,
            align: 1,
            subsamp: turbojpeg::Subsamp::Sub2x2,
        };

        let jpeg = self
            .compressor
            .compress_yuv_to_vec(yuv)
            .map_err(|e| AppError::Encoding(format!("YUV compression failed: {}", e)))?;
        Ok(Bytes::from(jpeg))
    }

    fn encode_yuyv(&mut self, data: &[u8], resolution: Resolution) -> Result<Bytes> {
        let width = resolution.width as usize;
        let height = resolution.height as usize;
        check_len(data, width * height * 2, PixelFormat::Yuyv)?;

        self.i420.resize(width * height * 3 / 2, 0);
        yuyv_to_i420(data, &mut self.i420, width, height);
        self.encode_i420(resolution)
    }

    fn encode_nv12(&mut self, data: &[u8], resolution: Resolution) -> Result<Bytes> {
        let width = resolution.width as usize;
        let height = resolution.height as usize;
        check_len(data, width * height * 3 / 2, PixelFormat::Nv12)?;

        self.i420.resize(width * height * 3 / 2, 0);
        nv12_to_i420(data, &mut self.i420, width, height);
        self.encode_i420(resolution)
    }

    fn encode_packed_rgb(
        &mut self,
        data: &[u8],
        resolution: Resolution,
        format: turbojpeg::PixelFormat,
        label: PixelFormat,
    ) -> Result<Bytes> {
        let width = resolution.width as usize;
        let height = resolution.height as usize;
        check_len(data, width * height * 3, label)?;

        let image = turbojpeg::Image {
            pixels: data,
            width,
            pitch: width * 3,
            height,
            format,
        };
        let jpeg = self
            .compressor
            .compress_to_vec(image)
            .map_err(|e| AppError::Encoding(format!("RGB compression failed: {}", e)))?;
        Ok(Bytes::from(jpeg))
    }
}

impl JpegEncode for TurboJpegEncoder {
    fn name(&self) -> &str {
        "turbojpeg"
    }

    fn encode(&mut self, frame: &Frame, quality: u8) -> Result<Bytes> {
        self.set_quality(quality)?;

        match frame.format {
            PixelFormat::Yuyv => self.encode_yuyv(frame.data(), frame.resolution),
            PixelFormat::Nv12 => self.encode_nv12(frame.data(), frame.resolution),
            PixelFormat::Rgb24 => self.encode_packed_rgb(
                frame.data(),
                frame.resolution,
                turbojpeg::PixelFormat::RGB,
                PixelFormat::Rgb24,
            ),
            PixelFormat::Bgr24 => self.encode_packed_rgb(
                frame.data(),
                frame.resolution,
                turbojpeg::PixelFormat::BGR,
                PixelFormat::Bgr24,
            ),
            other => Err(AppError::Encoding(format!(
                "unsupported input format for JPEG encoding: {}",
                other
            ))),
        }
    }

    fn supports(&self, format: PixelFormat) -> bool {
        matches!(
            format,
            PixelFormat::Yuyv | PixelFormat::Nv12 | PixelFormat::Rgb24 | PixelFormat::Bgr24
        )
    }
}

fn check_len(data: &[u8], expected: usize, format: PixelFormat) -> Result<()> {
    if data.len() < expected {
        return Err(AppError::Encoding(format!(
            "{} payload too small: {} < {}",
            format,
            data.len(),
            expected
        )));
    }
    Ok(())
}

/// YUYV (packed 4:2:2) to I420, subsampling chroma from even rows
fn yuyv_to_i420(src: &[u8], dst: &mut [u8], width: usize, height: usize) {
    let (y_plane, uv) = dst.split_at_mut(width * height);
    let (u_plane, v_plane) = uv.split_at_mut(width * height / 4);

    for row in 0..height {
        let src_row = &src[row * width * 2..(row + 1) * width * 2];
        let y_row = &mut y_plane[row * width..(row + 1) * width];

        for pair in 0..width / 2 {
            let base = pair * 4;
            y_row[pair * 2] = src_row[base];
            y_row[pair * 2 + 1] = src_row[base + 2];

            if row % 2 == 0 {
                let chroma_idx = (row / 2) * (width / 2) + pair;
                u_plane[chroma_idx] = src_row[base + 1];
                v_plane[chroma_idx] = src_row[base + 3];
            }
        }
    }
}

/// NV12 (semi-planar) to I420: copy Y, deinterleave UV
fn nv12_to_i420(src: &[u8], dst: &mut [u8], width: usize, height: usize) {
    let y_size = width * height;
    let (y_plane, uv) = dst.split_at_mut(y_size);
    let (u_plane, v_plane) = uv.split_at_mut(y_size / 4);

    y_plane.copy_from_slice(&src[..y_size]);

    let interleaved = &src[y_size..y_size + y_size / 2];
    for (i, chunk) in interleaved.chunks_exact(2).enumerate() {
        u_plane[i] = chunk[0];
        v_plane[i] = chunk[1];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_plane_split() {
        // 4x2 image: Y values 0..8, U=100, V=200
        let width = 4;
        let height = 2;
        let mut src = Vec::new();
        let mut y = 0u8;
        for _ in 0..height {
            for _ in 0..width / 2 {
                src.extend_from_slice(&[y, 100, y + 1, 200]);
                y += 2;
            }
        }

        let mut dst = vec![0u8; width * height * 3 / 2];
        yuyv_to_i420(&src, &mut dst, width, height);

        assert_eq!(&dst[..8], &[0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(&dst[8..10], &[100, 100]); // U
        assert_eq!(&dst[10..12], &[200, 200]); // V
    }

    #[test]
    fn test_nv12_plane_split() {
        let width = 4;
        let height = 2;
        let mut src: Vec<u8> = (0..8).collect(); // Y
        src.extend_from_slice(&[10, 20, 11, 21]); // interleaved UV

        let mut dst = vec![0u8; width * height * 3 / 2];
        nv12_to_i420(&src, &mut dst, width, height);

        assert_eq!(&dst[..8], &[0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(&dst[8..10], &[10, 11]); // U
        assert_eq!(&dst[10..12], &[20, 21]); // V
    }
}
