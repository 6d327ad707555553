//! The frame-source seam consumed by the recognition worker.

use crate::camera::CameraError;
use crate::frame::Frame;

/// Anything that yields camera frames one at a time.
///
/// A failed read is transient: callers back off and poll again.
pub trait FrameSource {
    fn read(&mut self) -> Result<Frame, CameraError>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn read(&mut self) -> Result<Frame, CameraError> {
        (**self).read()
    }
}
