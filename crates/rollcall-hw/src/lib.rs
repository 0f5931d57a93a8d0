//! rollcall-hw: V4L2 camera capture for the attendance pipeline.
//!
//! Frames are converted to 8-bit grayscale here so the core crate never
//! sees device pixel formats.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat, V4l2Opener};
