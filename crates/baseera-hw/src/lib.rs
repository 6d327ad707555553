//! baseera-hw — Camera capture for the attendance kiosk.
//!
//! Provides V4L2-based camera access, a streaming capture session that
//! the recognition worker pulls frames from, and grayscale frame helpers.

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{Camera, CameraError, CaptureSession, DeviceInfo, PixelFormat};
pub use frame::{Frame, FrameError};
pub use source::FrameSource;
