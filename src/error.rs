//! Error types for the frame pipeline

use std::fmt;
use std::io;

use thiserror::Error;

use crate::capture::frame::LayoutKind;

/// Result alias used across the library
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Shared memory operation that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmOp {
    Open,
    Truncate,
    Map,
    Unlink,
}

impl fmt::Display for ShmOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ShmOp::Open => "shm_open",
            ShmOp::Truncate => "ftruncate",
            ShmOp::Map => "mmap",
            ShmOp::Unlink => "shm_unlink",
        })
    }
}

/// Everything that can go wrong between a delivered frame and its consumers.
///
/// Per-frame variants (layout, shared memory, encode, transport) are absorbed
/// by the ingestion path. Only setup failures reach the process level.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unsupported pixel layout tag {0}")]
    UnsupportedLayout(u32),

    #[error("frame has an empty geometry ({width}x{height})")]
    EmptyFrame { width: u32, height: u32 },

    #[error("row stride {stride} is shorter than one row of {row_bytes} bytes")]
    InvalidStride { stride: u32, row_bytes: usize },

    #[error("frame buffer holds {actual} bytes but the layout needs {required}")]
    ShortBuffer { actual: usize, required: usize },

    #[error("{op} failed for {name}: {source}")]
    Shm {
        name: String,
        op: ShmOp,
        #[source]
        source: io::Error,
    },

    #[error("invalid shared memory name {0:?}")]
    InvalidShmName(String),

    #[error("failed to allocate {0} bytes")]
    Alloc(usize),

    #[error("{0} frames are not streamed")]
    NotStreamable(LayoutKind),

    #[error("JPEG encoding failed: {0}")]
    Encode(#[from] image::ImageError),

    #[error("transport write failed: {0}")]
    Transport(#[source] io::Error),

    #[error("capture device error: {0}")]
    Capture(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl PipelineError {
    pub(crate) fn shm(name: &str, op: ShmOp, source: impl Into<io::Error>) -> Self {
        PipelineError::Shm {
            name: name.to_owned(),
            op,
            source: source.into(),
        }
    }

    /// True for errors that mean "this frame cannot be decoded", as opposed to
    /// a failure in one of the publication stages.
    pub fn is_layout_error(&self) -> bool {
        matches!(
            self,
            PipelineError::UnsupportedLayout(_)
                | PipelineError::EmptyFrame { .. }
                | PipelineError::InvalidStride { .. }
                | PipelineError::ShortBuffer { .. }
        )
    }
}
