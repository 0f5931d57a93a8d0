//! Camera capability consumed by the capture activity.

use crate::frame::Frame;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// No device could be opened. Fatal to `start()`, not to the process.
    #[error("camera not available: {0}")]
    NotFound(String),
    /// A single frame could not be read; retried with backoff.
    #[error("frame unavailable: {0}")]
    Unavailable(String),
    /// The device went away for good; ends the capture activity.
    #[error("camera disconnected: {0}")]
    Disconnected(String),
}

/// A source of frames, polled by the capture activity at sensor rate.
///
/// `next_frame` may block until the device delivers a buffer.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Frame, CaptureError>;

    /// Human-readable name for logs (e.g. the device path).
    fn describe(&self) -> String {
        "camera".to_string()
    }
}

/// Opens a [`FrameSource`] on the capture thread.
///
/// The source is created and dropped on the thread that polls it, so the
/// camera handle is released when the capture activity ends.
pub trait SourceOpener: Send + Sync {
    fn open(&self) -> Result<Box<dyn FrameSource>, CaptureError>;
}
