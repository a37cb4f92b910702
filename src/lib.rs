pub mod capture;
pub mod display;
pub mod error;
pub mod pipeline;
pub mod utils;

use std::path::Path;

use capture::frame::LayoutKind;
use serde::{Deserialize, Serialize};

pub use capture::{FrameDescriptor, FrameSource, PixelLayout, RawFrame};
pub use error::{PipelineError, Result};
pub use pipeline::{FrameStore, Ingestor};

/// Prefix for environment overrides, e.g. `CAMSHM__STREAM__PORT=5002`
pub const ENV_PREFIX: &str = "CAMSHM";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    pub shm: ShmConfig,
    pub stream: StreamConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Requested size; the driver default when unset
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Requested layout; the driver default when unset
    pub layout: Option<LayoutKind>,
    pub buffer_count: u32,
    /// Test pattern frame rate
    pub fps: u32,
    /// Test pattern bytes of padding after every row
    pub row_padding: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub ring_capacity: usize,
    /// Pending status reports before new ones are dropped
    pub status_queue: usize,
    /// Pin the delivery thread to this core
    pub capture_core: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShmConfig {
    pub prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub jpeg_quality: u8,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: None,
            height: None,
            layout: None,
            buffer_count: 4,
            fps: 30,
            row_padding: 0,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ring_capacity: pipeline::ringbuf::DEFAULT_CAPACITY,
            status_queue: 4,
            capture_core: None,
        }
    }
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            prefix: "/camera".into(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "192.168.1.100".into(),
            port: 5001,
            jpeg_quality: pipeline::stream::DEFAULT_JPEG_QUALITY,
        }
    }
}

impl Config {
    /// Defaults, then the TOML file at `path` if given, then `CAMSHM__*`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            ::config::Config::builder().add_source(::config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Toml)
                    .required(true),
            );
        }
        let config: Config = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.capture.width == Some(0) || self.capture.height == Some(0) {
            return Err(PipelineError::InvalidConfig(
                "capture.width and capture.height must be at least 1".into(),
            ));
        }
        if self.pipeline.ring_capacity == 0 {
            return Err(PipelineError::InvalidConfig(
                "pipeline.ring_capacity must be at least 1".into(),
            ));
        }
        if self.pipeline.status_queue == 0 {
            return Err(PipelineError::InvalidConfig(
                "pipeline.status_queue must be at least 1".into(),
            ));
        }
        if !(1..=100).contains(&self.stream.jpeg_quality) {
            return Err(PipelineError::InvalidConfig(format!(
                "stream.jpeg_quality must be within 1..=100, got {}",
                self.stream.jpeg_quality
            )));
        }
        pipeline::ShmNamespace::new(self.shm.prefix.clone())?;
        Ok(())
    }
}
