//! Application configuration
//!
//! Loaded from an optional TOML file; every section falls back to defaults
//! so a missing or partial file is always valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Web server settings
    pub server: ServerConfig,
    /// Camera defaults
    pub camera: CameraConfig,
    /// Storage directories
    pub storage: StorageConfig,
    /// Recorder settings
    pub recorder: RecorderConfig,
    /// Streaming settings
    pub stream: StreamConfig,
    /// Authentication settings
    pub auth: AuthConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            camera: CameraConfig::default(),
            storage: StorageConfig::default(),
            recorder: RecorderConfig::default(),
            stream: StreamConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        toml::from_str(&raw)
            .map_err(|e| AppError::InvalidArgument(format!("Invalid config file: {}", e)))
    }

    /// Load from a file if it exists, otherwise defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

/// Web server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub bind_address: String,
    /// HTTP port
    pub port: u16,
    /// Maximum concurrent stream clients (HTTP + WS combined)
    pub max_stream_clients: usize,
    /// CORS allowed origin
    pub cors_origin: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8081,
            max_stream_clients: 5,
            cors_origin: "*".to_string(),
        }
    }
}

/// Camera capture defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Default video device path
    pub default_device: String,
    /// Default resolution width
    pub default_width: u32,
    /// Default resolution height
    pub default_height: u32,
    /// Default frame rate
    pub default_fps: u32,
    /// Preferred pixel format (e.g. "MJPEG", "YUYV")
    pub default_format: String,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            default_device: "/dev/video0".to_string(),
            default_width: 1280,
            default_height: 720,
            default_fps: 30,
            default_format: "MJPEG".to_string(),
        }
    }
}

/// Storage directory layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for recorded videos
    pub videos_dir: PathBuf,
    /// Directory for captured photos
    pub photos_dir: PathBuf,
    /// Directory for extracted frames
    pub frames_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            videos_dir: PathBuf::from("videos"),
            photos_dir: PathBuf::from("photos"),
            frames_dir: PathBuf::from("frames"),
        }
    }
}

impl StorageConfig {
    /// Create all storage directories
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.videos_dir, &self.photos_dir, &self.frames_dir] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Recorder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Rotate after this many seconds (0 = unlimited)
    pub rotate_max_duration_s: u64,
    /// Rotate after this many bytes (0 = unlimited)
    pub rotate_max_bytes: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            rotate_max_duration_s: 0,
            rotate_max_bytes: 0,
        }
    }
}

/// Streaming configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Default JPEG quality (1-100)
    pub default_jpeg_quality: u8,
    /// Default maximum frames per second per client
    pub default_max_fps: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            default_jpeg_quality: 80,
            default_max_fps: 30,
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Optional pre-shared API key; requests must carry it in `X-API-Key`
    pub api_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8081);
        assert_eq!(config.server.max_stream_clients, 5);
        assert_eq!(config.stream.default_jpeg_quality, 80);
        assert_eq!(config.stream.default_max_fps, 30);
        assert_eq!(config.recorder.rotate_max_duration_s, 0);
        assert!(config.auth.api_key.is_none());
    }

    #[test]
    fn test_partial_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "[server]\nport = 9090\n\n[stream]\ndefault_max_fps = 15"
        )
        .unwrap();

        let config = AppConfig::load(f.path()).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.stream.default_max_fps, 15);
        // Untouched sections keep defaults
        assert_eq!(config.camera.default_fps, 30);
        assert_eq!(config.storage.photos_dir, PathBuf::from("photos"));
    }

    #[test]
    fn test_missing_file_is_default() {
        let config = AppConfig::load_or_default("/nonexistent/edgecam.toml").unwrap();
        assert_eq!(config.server.port, 8081);
    }
}
