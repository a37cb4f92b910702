//! JPEG encode and length-prefixed send over a byte stream.
//!
//! Wire format per frame: `[u64 native-endian length][length bytes of JPEG]`,
//! written as two separate writes. No magic, checksum or version.

use std::io::Write;
use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use tracing::{debug, warn};

use crate::capture::frame::PixelLayout;
use crate::error::{PipelineError, Result};

pub const DEFAULT_JPEG_QUALITY: u8 = 75;

/// Length of the size prefix in front of every payload
pub const PREFIX_LEN: usize = 8;

/// Best-effort frame sink. A broken transport is never reopened; each
/// later frame fails on its own and the failure is absorbed the same way.
pub struct StreamSink<W> {
    writer: W,
    quality: u8,
    frames_sent: u64,
    send_failures: u64,
}

impl<W: Write> StreamSink<W> {
    pub fn new(writer: W, quality: u8) -> Self {
        Self {
            writer,
            quality: quality.clamp(1, 100),
            frames_sent: 0,
            send_failures: 0,
        }
    }

    /// Encode one packed frame and send it. Returns the payload length.
    pub fn send_frame(&mut self, layout: &PixelLayout, data: &[u8]) -> Result<usize> {
        let start = Instant::now();
        let rgb = pack_rgb(layout, data)?;
        let jpeg = encode_jpeg(&rgb, layout.width(), layout.height(), self.quality)?;
        metrics::histogram!("encode_time_us").record(start.elapsed().as_micros() as f64);

        self.write_framed(&jpeg)?;
        Ok(jpeg.len())
    }

    /// Write the size prefix, then the payload
    pub fn write_framed(&mut self, payload: &[u8]) -> Result<()> {
        let prefix = (payload.len() as u64).to_ne_bytes();
        let result = self
            .writer
            .write_all(&prefix)
            .and_then(|()| self.writer.write_all(payload))
            .and_then(|()| self.writer.flush());

        match result {
            Ok(()) => {
                self.frames_sent += 1;
                Ok(())
            }
            Err(e) => {
                self.send_failures += 1;
                if self.send_failures == 1 {
                    warn!("stream transport failed, later failures are logged at debug: {}", e);
                } else {
                    debug!(failures = self.send_failures, "stream write failed: {}", e);
                }
                Err(PipelineError::Transport(e))
            }
        }
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn send_failures(&self) -> u64 {
        self.send_failures
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Drop the fourth byte of every RGB8888 pixel, row by row, into tight RGB
pub fn pack_rgb(layout: &PixelLayout, data: &[u8]) -> Result<Vec<u8>> {
    if !layout.kind().is_streamable() {
        return Err(PipelineError::NotStreamable(layout.kind()));
    }
    layout.check_len(data)?;

    let len = layout.width() as usize * layout.height() as usize * 3;
    let mut rgb = Vec::new();
    rgb.try_reserve_exact(len)
        .map_err(|_| PipelineError::Alloc(len))?;

    for row in layout.rows(data) {
        for px in row.chunks_exact(4) {
            rgb.extend_from_slice(&px[..3]);
        }
    }
    Ok(rgb)
}

/// Baseline JPEG of a tightly packed RGB buffer
pub fn encode_jpeg(rgb: &[u8], width: u32, height: u32, quality: u8) -> Result<Bytes> {
    let mut out = BytesMut::with_capacity(rgb.len() / 8).writer();
    JpegEncoder::new_with_quality(&mut out, quality).encode(
        rgb,
        width,
        height,
        ExtendedColorType::Rgb8,
    )?;
    Ok(out.into_inner().freeze())
}
