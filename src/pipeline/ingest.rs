//! Per-frame orchestration: one callback invocation drives every stage.

use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::capture::frame::{PixelLayout, RawFrame};
use crate::capture::FrameSource;
use crate::error::{PipelineError, Result};
use crate::pipeline::publish::{LatestFramePublisher, MetadataPublisher, MetadataRecord};
use crate::pipeline::ringbuf::FrameStore;
use crate::pipeline::shm::ShmNamespace;
use crate::pipeline::stats::{self, ChannelAverages};
use crate::pipeline::stream::StreamSink;
use crate::Config;

/// Stages run for every decodable frame, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Store,
    Latest,
    Metadata,
    Stream,
    Statistics,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Store => "frame store",
            Stage::Latest => "latest frame",
            Stage::Metadata => "metadata",
            Stage::Stream => "stream",
            Stage::Statistics => "statistics",
        })
    }
}

#[derive(Debug)]
pub struct StageFailure {
    pub stage: Stage,
    pub error: PipelineError,
}

/// What one callback invocation did
#[derive(Debug)]
pub enum FrameOutcome {
    /// The frame could not be decoded; no stage ran
    Skipped(PipelineError),
    Processed(ProcessedFrame),
}

#[derive(Debug)]
pub struct ProcessedFrame {
    pub layout: PixelLayout,
    /// Sequence in the frame store, if the push succeeded
    pub sequence: Option<u64>,
    pub latest_published: bool,
    /// JPEG payload length, if the frame was streamed
    pub streamed: Option<usize>,
    pub averages: ChannelAverages,
    pub stats_time: Duration,
    pub failures: Vec<StageFailure>,
}

/// Status line updates sent to the display
#[derive(Debug, Clone, PartialEq)]
pub enum StatusReport {
    Averages {
        averages: ChannelAverages,
        elapsed: Duration,
        failed_stages: usize,
    },
    Unsupported {
        tag: u32,
    },
    Skipped {
        reason: String,
    },
}

/// Everything the callback touches, owned in one place
pub struct IngestContext<W> {
    pub store: Arc<FrameStore>,
    pub latest: LatestFramePublisher,
    pub metadata: MetadataPublisher,
    pub stream: Option<StreamSink<W>>,
}

impl<W: Write> IngestContext<W> {
    /// Setup-phase construction. Any error here is fatal to the caller.
    pub fn from_config(config: &Config, writer: Option<W>) -> Result<Self> {
        let namespace = ShmNamespace::new(config.shm.prefix.clone())?;
        let metadata = MetadataPublisher::create(&namespace)?;
        let store = Arc::new(FrameStore::new(namespace.clone(), config.pipeline.ring_capacity)?);
        Ok(Self {
            store,
            latest: LatestFramePublisher::new(&namespace),
            metadata,
            stream: writer.map(|w| StreamSink::new(w, config.stream.jpeg_quality)),
        })
    }
}

pub struct Ingestor<W> {
    ctx: IngestContext<W>,
    status: Option<flume::Sender<StatusReport>>,
    frames_seen: u64,
}

impl<W: Write> Ingestor<W> {
    pub fn new(ctx: IngestContext<W>) -> Self {
        Self {
            ctx,
            status: None,
            frames_seen: 0,
        }
    }

    /// Send status reports to `tx`. Reports are dropped when it is full.
    pub fn with_status(mut self, tx: flume::Sender<StatusReport>) -> Self {
        self.status = Some(tx);
        self
    }

    pub fn context(&self) -> &IngestContext<W> {
        &self.ctx
    }

    pub fn store(&self) -> &Arc<FrameStore> {
        &self.ctx.store
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    /// Callback entry point. Never fails: every stage's error is contained
    /// and the remaining stages still run.
    pub fn on_frame(&mut self, raw: RawFrame<'_>) -> FrameOutcome {
        self.frames_seen += 1;
        metrics::counter!("frames_ingested").increment(1);

        let layout = match PixelLayout::decode(raw.tag, raw.desc)
            .and_then(|layout| layout.check_len(raw.data).map(|()| layout))
        {
            Ok(layout) => layout,
            Err(e) => {
                metrics::counter!("frames_unsupported").increment(1);
                debug!(tag = raw.tag, "skipping frame: {}", e);
                self.report(match e {
                    PipelineError::UnsupportedLayout(tag) => StatusReport::Unsupported { tag },
                    ref other => StatusReport::Skipped {
                        reason: other.to_string(),
                    },
                });
                return FrameOutcome::Skipped(e);
            }
        };

        let mut failures = Vec::new();

        let sequence = match self.ctx.store.push(&layout, raw.data) {
            Ok(sequence) => Some(sequence),
            Err(error) => {
                failures.push(StageFailure {
                    stage: Stage::Store,
                    error,
                });
                None
            }
        };

        let latest_published = match self.ctx.latest.publish(&layout, raw.data) {
            Ok(()) => true,
            Err(error) => {
                failures.push(StageFailure {
                    stage: Stage::Latest,
                    error,
                });
                false
            }
        };

        self.ctx.metadata.publish(MetadataRecord::from_layout(&layout));

        let streamed = self.stream(&layout, raw.data, &mut failures);

        let start = Instant::now();
        let averages = stats::channel_averages(&layout, raw.data);
        let stats_time = start.elapsed();
        metrics::histogram!("stats_time_us").record(stats_time.as_micros() as f64);

        for failure in &failures {
            metrics::counter!("stage_failures").increment(1);
            // Transport failures log themselves in the sink.
            if failure.stage != Stage::Stream {
                warn!(stage = %failure.stage, "frame stage failed: {}", failure.error);
            }
        }

        self.report(StatusReport::Averages {
            averages,
            elapsed: stats_time,
            failed_stages: failures.len(),
        });

        FrameOutcome::Processed(ProcessedFrame {
            layout,
            sequence,
            latest_published,
            streamed,
            averages,
            stats_time,
            failures,
        })
    }

    fn stream(
        &mut self,
        layout: &PixelLayout,
        data: &[u8],
        failures: &mut Vec<StageFailure>,
    ) -> Option<usize> {
        let sink = self.ctx.stream.as_mut()?;
        if !layout.kind().is_streamable() {
            return None;
        }
        match sink.send_frame(layout, data) {
            Ok(len) => Some(len),
            Err(error) => {
                failures.push(StageFailure {
                    stage: Stage::Stream,
                    error,
                });
                None
            }
        }
    }

    fn report(&self, report: StatusReport) {
        if let Some(tx) = &self.status {
            // A slow display loses updates; ingestion never waits for it.
            let _ = tx.try_send(report);
        }
    }

    /// Release every shared segment. Safe to call more than once.
    pub fn teardown(&mut self) {
        self.ctx.store.teardown();
        self.ctx.latest.teardown();
        self.ctx.metadata.teardown();
        info!(frames = self.frames_seen, "ingestion torn down");
    }
}

impl<W: Write + Send + 'static> Ingestor<W> {
    /// Run `source` on a dedicated delivery thread until `stop` is set or the
    /// source ends. The thread hands the ingestor back for teardown and
    /// signals `done` when it exits.
    pub fn spawn(
        mut self,
        mut source: Box<dyn FrameSource>,
        stop: Arc<AtomicBool>,
        core: Option<usize>,
    ) -> std::io::Result<(JoinHandle<(Self, Result<()>)>, oneshot::Receiver<()>)> {
        let (done_tx, done_rx) = oneshot::channel();
        let handle = thread::Builder::new()
            .name("frame-delivery".into())
            .spawn(move || {
                if let Some(id) = core {
                    if !core_affinity::set_for_current(core_affinity::CoreId { id }) {
                        warn!(core = id, "failed to pin delivery thread");
                    }
                }
                info!(source = %source.describe(), "frame delivery started");
                let result = source.run(&stop, &mut |raw| {
                    self.on_frame(raw);
                });
                if let Err(e) = &result {
                    error!("frame source stopped: {}", e);
                }
                stop.store(true, Ordering::Release);
                let _ = done_tx.send(());
                (self, result)
            })?;
        Ok((handle, done_rx))
    }
}
