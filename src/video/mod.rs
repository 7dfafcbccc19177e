//! Video capture, frame distribution and encoding

pub mod bus;
pub mod capture;
pub mod device;
pub mod encoder;
pub mod format;
pub mod frame;

pub use bus::{BusEvent, DropPolicy, FrameBus, SubscriberHandle, SubscriberKind};
pub use capture::{CaptureConfig, CaptureSession, CaptureState, GrantedParams};
pub use format::{PixelFormat, Resolution};
pub use frame::Frame;
