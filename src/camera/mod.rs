//! Camera control: exclusive ownership of the capture session

mod controller;

pub use controller::{CameraController, CameraStatus};
