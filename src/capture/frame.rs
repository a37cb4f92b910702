use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Layout tag for Y0 Cb Y1 Cr macro-pixels
pub const TAG_YCBYCR: u32 = 1;
/// Layout tag for Cb Y0 Cr Y1 macro-pixels
pub const TAG_CBYCRY: u32 = 2;
/// Layout tag for R G B X pixels
pub const TAG_RGB8888: u32 = 3;
/// Layout tag for B G R X pixels
pub const TAG_BGR8888: u32 = 4;

/// Pixel layouts we ingest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayoutKind {
    Ycbycr,
    Cbycry,
    Rgb8888,
    Bgr8888,
}

/// Ordering of the three averaged channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    YCbCr,
}

impl ChannelOrder {
    pub fn labels(self) -> [&'static str; 3] {
        match self {
            ChannelOrder::Rgb => ["R", "G", "B"],
            ChannelOrder::YCbCr => ["Y", "Cb", "Cr"],
        }
    }
}

impl LayoutKind {
    pub const ALL: [LayoutKind; 4] = [
        LayoutKind::Ycbycr,
        LayoutKind::Cbycry,
        LayoutKind::Rgb8888,
        LayoutKind::Bgr8888,
    ];

    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            TAG_YCBYCR => Some(LayoutKind::Ycbycr),
            TAG_CBYCRY => Some(LayoutKind::Cbycry),
            TAG_RGB8888 => Some(LayoutKind::Rgb8888),
            TAG_BGR8888 => Some(LayoutKind::Bgr8888),
            _ => None,
        }
    }

    pub fn tag(self) -> u32 {
        match self {
            LayoutKind::Ycbycr => TAG_YCBYCR,
            LayoutKind::Cbycry => TAG_CBYCRY,
            LayoutKind::Rgb8888 => TAG_RGB8888,
            LayoutKind::Bgr8888 => TAG_BGR8888,
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        if self.is_packed() {
            4
        } else {
            2
        }
    }

    /// Packed 4-byte layouts, as opposed to 2-byte chroma-subsampled ones
    pub fn is_packed(self) -> bool {
        matches!(self, LayoutKind::Rgb8888 | LayoutKind::Bgr8888)
    }

    pub fn channel_order(self) -> ChannelOrder {
        if self.is_packed() {
            ChannelOrder::Rgb
        } else {
            ChannelOrder::YCbCr
        }
    }

    /// Channel index of each byte in a repeating 4-byte group.
    ///
    /// Packed layouts map to (R, G, B) with the padding byte skipped. Chroma
    /// layouts map to (Y, Cb, Cr) over one two-pixel macro-pixel.
    pub fn byte_channels(self) -> [Option<usize>; 4] {
        match self {
            LayoutKind::Rgb8888 => [Some(0), Some(1), Some(2), None],
            LayoutKind::Bgr8888 => [Some(2), Some(1), Some(0), None],
            LayoutKind::Ycbycr => [Some(0), Some(1), Some(0), Some(2)],
            LayoutKind::Cbycry => [Some(1), Some(0), Some(2), Some(0)],
        }
    }

    /// Only RGB8888 goes out on the JPEG stream; its first three bytes are
    /// already R, G, B.
    pub fn is_streamable(self) -> bool {
        self == LayoutKind::Rgb8888
    }

    pub fn name(self) -> &'static str {
        match self {
            LayoutKind::Ycbycr => "ycbycr",
            LayoutKind::Cbycry => "cbycry",
            LayoutKind::Rgb8888 => "rgb8888",
            LayoutKind::Bgr8888 => "bgr8888",
        }
    }
}

impl fmt::Display for LayoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LayoutKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        LayoutKind::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                format!("unknown layout {s:?} (expected ycbycr, cbycry, rgb8888 or bgr8888)")
            })
    }
}

/// Geometry reported by the driver alongside each buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameDescriptor {
    pub width: u32,
    pub height: u32,
    /// Bytes per row, may exceed `width * bytes_per_pixel`
    pub stride: u32,
}

impl FrameDescriptor {
    pub fn new(width: u32, height: u32, stride: u32) -> Self {
        Self {
            width,
            height,
            stride,
        }
    }
}

/// One frame as handed over by the driver. Borrowed for the callback only.
#[derive(Debug, Clone, Copy)]
pub struct RawFrame<'a> {
    pub tag: u32,
    pub desc: FrameDescriptor,
    pub data: &'a [u8],
}

/// Decoded, validated frame geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelLayout {
    kind: LayoutKind,
    width: u32,
    height: u32,
    stride: u32,
}

impl PixelLayout {
    /// Decode a driver tag and descriptor.
    ///
    /// Unknown tags and zero-sized frames are rejected, which short-circuits
    /// every downstream stage for that frame.
    pub fn decode(tag: u32, desc: FrameDescriptor) -> Result<Self> {
        let kind = LayoutKind::from_tag(tag).ok_or(PipelineError::UnsupportedLayout(tag))?;
        Self::new(kind, desc)
    }

    pub fn new(kind: LayoutKind, desc: FrameDescriptor) -> Result<Self> {
        if desc.width == 0 || desc.height == 0 {
            return Err(PipelineError::EmptyFrame {
                width: desc.width,
                height: desc.height,
            });
        }
        let row_bytes = desc.width as usize * kind.bytes_per_pixel();
        if (desc.stride as usize) < row_bytes {
            return Err(PipelineError::InvalidStride {
                stride: desc.stride,
                row_bytes,
            });
        }
        Ok(Self {
            kind,
            width: desc.width,
            height: desc.height,
            stride: desc.stride,
        })
    }

    /// Same geometry with rows packed back to back
    pub fn packed(&self) -> Self {
        Self {
            stride: self.row_bytes() as u32,
            ..*self
        }
    }

    pub fn kind(&self) -> LayoutKind {
        self.kind
    }

    pub fn tag(&self) -> u32 {
        self.kind.tag()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.kind.bytes_per_pixel()
    }

    /// Meaningful bytes in one row, without stride padding
    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.bytes_per_pixel()
    }

    /// Size of the tightly packed frame: width * height * bytes_per_pixel
    pub fn byte_size(&self) -> usize {
        self.row_bytes() * self.height as usize
    }

    /// Minimum length of a raw buffer described by this layout.
    /// The last row does not need its stride padding.
    pub fn required_len(&self) -> usize {
        self.stride as usize * (self.height as usize - 1) + self.row_bytes()
    }

    pub fn check_len(&self, data: &[u8]) -> Result<()> {
        let required = self.required_len();
        if data.len() < required {
            return Err(PipelineError::ShortBuffer {
                actual: data.len(),
                required,
            });
        }
        Ok(())
    }

    /// Rows of `data`, each trimmed to `row_bytes`
    pub fn rows<'a>(&self, data: &'a [u8]) -> impl Iterator<Item = &'a [u8]> + 'a {
        let row_bytes = self.row_bytes();
        data.chunks(self.stride as usize)
            .take(self.height as usize)
            .filter_map(move |row| row.get(..row_bytes))
    }

    /// Copy `data` into `dst` with stride padding removed.
    /// `dst` must be `byte_size()` long.
    pub fn copy_packed(&self, data: &[u8], dst: &mut [u8]) {
        let row_bytes = self.row_bytes();
        for (dst_row, src_row) in dst.chunks_exact_mut(row_bytes).zip(self.rows(data)) {
            dst_row.copy_from_slice(src_row);
        }
    }
}
