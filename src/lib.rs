//! edgecam — edge-device camera streaming and recording server
//!
//! Opens a V4L2 capture device, fans frames out to HTTP MJPEG and
//! WebSocket clients, records segmented MJPEG files and decomposes
//! recordings back into per-frame images, all behind a small REST/WS
//! control surface.

pub mod camera;
pub mod config;
pub mod error;
pub mod extract;
pub mod record;
pub mod state;
pub mod stream;
pub mod video;
pub mod web;
