//! Offline frame extraction

mod worker;

pub use worker::{scan_jpeg_frames, ExtractionManager, ExtractionState, ExtractionStatus, Packager};
