//! Synthetic frame source for running the pipeline without a camera

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::capture::frame::{FrameDescriptor, LayoutKind, PixelLayout, RawFrame};
use crate::capture::FrameSource;
use crate::error::{PipelineError, Result};
use crate::CaptureConfig;

/// Emits a moving gradient in any supported layout at a fixed rate
pub struct TestPattern {
    kind: LayoutKind,
    desc: FrameDescriptor,
    interval: Duration,
    frame_limit: Option<u64>,
    counter: u64,
}

impl TestPattern {
    /// `row_padding` extra bytes are appended to every row to exercise stride
    /// handling downstream.
    pub fn new(
        kind: LayoutKind,
        width: u32,
        height: u32,
        row_padding: u32,
        fps: u32,
    ) -> Result<Self> {
        let stride = width
            .checked_mul(kind.bytes_per_pixel() as u32)
            .and_then(|row| row.checked_add(row_padding))
            .ok_or_else(|| {
                PipelineError::InvalidConfig(format!(
                    "test pattern row of {width} pixels plus {row_padding} bytes overflows"
                ))
            })?;
        let desc = FrameDescriptor::new(width, height, stride);
        PixelLayout::new(kind, desc)?;
        Ok(Self {
            kind,
            desc,
            interval: Duration::from_secs(1) / fps.max(1),
            frame_limit: None,
            counter: 0,
        })
    }

    pub fn from_config(kind: LayoutKind, config: &CaptureConfig) -> Result<Self> {
        Self::new(
            kind,
            config.width.unwrap_or(640),
            config.height.unwrap_or(480),
            config.row_padding,
            config.fps,
        )
    }

    /// Stop after `limit` frames
    pub fn with_frame_limit(mut self, limit: u64) -> Self {
        self.frame_limit = Some(limit);
        self
    }

    pub fn descriptor(&self) -> FrameDescriptor {
        self.desc
    }

    /// Raw buffer for frame `n`, padding bytes included
    pub fn frame(&self, n: u64) -> Vec<u8> {
        let stride = self.desc.stride as usize;
        let row_bytes = self.desc.width as usize * self.kind.bytes_per_pixel();
        let mut data = vec![0u8; stride * self.desc.height as usize];
        let shift = n as usize;

        for (y, row) in data.chunks_exact_mut(stride).enumerate() {
            for (i, byte) in row[..row_bytes].iter_mut().enumerate() {
                *byte = match self.kind.byte_channels()[i % 4] {
                    Some(ch) => ((i / 4 + y + shift) * (ch + 1) % 256) as u8,
                    None => 0xFF,
                };
            }
        }
        data
    }
}

impl FrameSource for TestPattern {
    fn describe(&self) -> String {
        format!(
            "test pattern {} {}x{} stride {}",
            self.kind, self.desc.width, self.desc.height, self.desc.stride
        )
    }

    fn run(&mut self, stop: &AtomicBool, on_frame: &mut dyn FnMut(RawFrame<'_>)) -> Result<()> {
        let mut next = Instant::now();
        while !stop.load(Ordering::Acquire) {
            if self.frame_limit.is_some_and(|limit| self.counter >= limit) {
                debug!(frames = self.counter, "test pattern exhausted");
                break;
            }
            let data = self.frame(self.counter);
            on_frame(RawFrame {
                tag: self.kind.tag(),
                desc: self.desc,
                data: &data,
            });
            self.counter += 1;

            next += self.interval;
            let now = Instant::now();
            if next > now {
                thread::sleep(next - now);
            } else {
                next = now;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_match_descriptor() {
        for kind in LayoutKind::ALL {
            let pattern = TestPattern::new(kind, 6, 4, 8, 30).unwrap();
            let layout = PixelLayout::decode(kind.tag(), pattern.descriptor()).unwrap();
            let data = pattern.frame(0);
            layout.check_len(&data).unwrap();
            assert_ne!(pattern.frame(0), pattern.frame(1));
        }
    }

    #[test]
    fn test_frame_limit() {
        let mut pattern = TestPattern::new(LayoutKind::Rgb8888, 4, 2, 0, 1000)
            .unwrap()
            .with_frame_limit(3);
        let stop = AtomicBool::new(false);
        let mut seen = 0;
        pattern
            .run(&stop, &mut |raw| {
                assert_eq!(raw.tag, LayoutKind::Rgb8888.tag());
                seen += 1;
            })
            .unwrap();
        assert_eq!(seen, 3);
    }

    #[test]
    fn test_degenerate_geometry_is_rejected() {
        assert!(matches!(
            TestPattern::new(LayoutKind::Rgb8888, 0, 4, 0, 30),
            Err(PipelineError::EmptyFrame { .. })
        ));
        assert!(TestPattern::new(LayoutKind::Ycbycr, 4, 0, 0, 30).is_err());
        assert!(matches!(
            TestPattern::new(LayoutKind::Bgr8888, u32::MAX / 2, 1, 0, 30),
            Err(PipelineError::InvalidConfig(_))
        ));
        assert!(TestPattern::new(LayoutKind::Rgb8888, 4, 1, u32::MAX, 30).is_err());
    }
}
