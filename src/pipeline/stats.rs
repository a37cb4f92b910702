//! Per-channel byte averages for the status line

use std::fmt;

use crate::capture::frame::{ChannelOrder, PixelLayout};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelAverages {
    pub order: ChannelOrder,
    pub values: [f64; 3],
}

impl fmt::Display for ChannelAverages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c] = self.values;
        write!(f, "{a:.3}, {b:.3}, {c:.3}")
    }
}

/// Mean byte value of each channel over the whole frame.
///
/// Packed layouts yield (R, G, B) whatever their byte order; chroma layouts
/// yield (Y, Cb, Cr), where the chroma channels are sampled once per two
/// pixels. Each channel is divided by the number of samples it actually has,
/// so odd widths never divide by zero.
pub fn channel_averages(layout: &PixelLayout, data: &[u8]) -> ChannelAverages {
    let channels = layout.kind().byte_channels();
    let mut sums = [0u64; 3];
    let mut counts = [0u64; 3];

    for row in layout.rows(data) {
        for (i, &byte) in row.iter().enumerate() {
            if let Some(ch) = channels[i % 4] {
                sums[ch] += u64::from(byte);
                counts[ch] += 1;
            }
        }
    }

    let mut values = [0.0; 3];
    for ch in 0..3 {
        if counts[ch] > 0 {
            values[ch] = sums[ch] as f64 / counts[ch] as f64;
        }
    }

    ChannelAverages {
        order: layout.kind().channel_order(),
        values,
    }
}
