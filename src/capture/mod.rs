pub mod frame;
pub mod test_pattern;
pub mod v4l2;

use std::sync::atomic::AtomicBool;

use crate::error::Result;

pub use frame::{FrameDescriptor, LayoutKind, PixelLayout, RawFrame};
pub use test_pattern::TestPattern;
pub use v4l2::V4l2Source;

/// A driver that delivers frames to a callback on its own thread.
///
/// `on_frame` is invoked once per frame and never concurrently with itself.
/// The borrowed buffer is only valid for that call.
pub trait FrameSource: Send {
    fn describe(&self) -> String;

    /// Deliver frames until `stop` is set or the source is exhausted
    fn run(&mut self, stop: &AtomicBool, on_frame: &mut dyn FnMut(RawFrame<'_>)) -> Result<()>;
}
