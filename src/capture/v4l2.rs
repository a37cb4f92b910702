//! V4L2 frame source with memory-mapped driver buffers

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, instrument};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::frame::{FrameDescriptor, LayoutKind, PixelLayout, RawFrame};
use crate::capture::FrameSource;
use crate::error::{PipelineError, Result};
use crate::CaptureConfig;

/// Layout tag for a V4L2 fourcc. Unknown fourccs keep their raw code so they
/// are reported as unsupported downstream.
pub fn layout_tag(fourcc: FourCC) -> u32 {
    layout_for_fourcc(fourcc)
        .map(LayoutKind::tag)
        .unwrap_or_else(|| u32::from_le_bytes(fourcc.repr))
}

pub fn layout_for_fourcc(fourcc: FourCC) -> Option<LayoutKind> {
    match &fourcc.repr {
        b"YUYV" => Some(LayoutKind::Ycbycr),
        b"UYVY" => Some(LayoutKind::Cbycry),
        // byte order R, G, B, X in memory
        b"AB24" | b"XB24" => Some(LayoutKind::Rgb8888),
        // byte order B, G, R, X in memory
        b"AR24" | b"XR24" | b"BGR4" => Some(LayoutKind::Bgr8888),
        _ => None,
    }
}

pub fn fourcc_for_layout(kind: LayoutKind) -> FourCC {
    match kind {
        LayoutKind::Ycbycr => FourCC::new(b"YUYV"),
        LayoutKind::Cbycry => FourCC::new(b"UYVY"),
        LayoutKind::Rgb8888 => FourCC::new(b"XB24"),
        LayoutKind::Bgr8888 => FourCC::new(b"XR24"),
    }
}

/// Camera unit `N` opened as `/dev/videoN`
pub struct V4l2Source {
    device: Device,
    path: String,
    tag: u32,
    desc: FrameDescriptor,
    buffer_count: u32,
}

fn device_error(path: &str, what: &str, e: impl std::fmt::Display) -> PipelineError {
    PipelineError::Capture(format!("{path}: {what}: {e}"))
}

impl V4l2Source {
    /// Open and configure the device. Fails if the negotiated format is not
    /// one of the supported layouts.
    pub fn open(config: &CaptureConfig, unit: usize) -> Result<Self> {
        let path = format!("/dev/video{unit}");
        info!("Initializing V4L2 capture: {}", path);

        let device = Device::with_path(&path).map_err(|e| device_error(&path, "open", e))?;

        let caps = device
            .query_caps()
            .map_err(|e| device_error(&path, "query caps", e))?;
        info!("Device: {} ({})", caps.card, caps.driver);
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(device_error(&path, "capabilities", "no video capture support"));
        }

        let mut fmt = device
            .format()
            .map_err(|e| device_error(&path, "get format", e))?;
        if let Some(width) = config.width {
            fmt.width = width;
        }
        if let Some(height) = config.height {
            fmt.height = height;
        }
        if let Some(kind) = config.layout {
            fmt.fourcc = fourcc_for_layout(kind);
        }
        let fmt = device
            .set_format(&fmt)
            .map_err(|e| device_error(&path, "set format", e))?;

        let tag = layout_tag(fmt.fourcc);
        let desc = FrameDescriptor::new(fmt.width, fmt.height, fmt.stride);
        let layout = PixelLayout::decode(tag, desc)?;
        info!(
            "Format: {} {}x{} stride {} ({})",
            fmt.fourcc,
            layout.width(),
            layout.height(),
            layout.stride(),
            layout.kind()
        );

        Ok(Self {
            device,
            path,
            tag,
            desc,
            buffer_count: config.buffer_count,
        })
    }
}

impl FrameSource for V4l2Source {
    fn describe(&self) -> String {
        format!(
            "{} {}x{} tag {}",
            self.path, self.desc.width, self.desc.height, self.tag
        )
    }

    #[instrument(skip_all, fields(device = %self.path))]
    fn run(&mut self, stop: &AtomicBool, on_frame: &mut dyn FnMut(RawFrame<'_>)) -> Result<()> {
        let mut stream =
            MmapStream::with_buffers(&self.device, Type::VideoCapture, self.buffer_count)
                .map_err(|e| device_error(&self.path, "start stream", e))?;
        info!("Capture stream started with {} buffers", self.buffer_count);

        while !stop.load(Ordering::Acquire) {
            let (buf, meta) = stream
                .next()
                .map_err(|e| device_error(&self.path, "dequeue", e))?;
            let used = (meta.bytesused as usize).min(buf.len());
            let data = if used == 0 { &buf[..] } else { &buf[..used] };
            on_frame(RawFrame {
                tag: self.tag,
                desc: self.desc,
                data,
            });
        }
        Ok(())
    }
}
