pub mod ingest;
pub mod publish;
pub mod ringbuf;
pub mod shm;
pub mod stats;
pub mod stream;

pub use ingest::{FrameOutcome, IngestContext, Ingestor, StatusReport};
pub use publish::{LatestFramePublisher, MetadataPublisher, MetadataRecord};
pub use ringbuf::FrameStore;
pub use shm::{SharedSegment, ShmNamespace};
pub use stream::StreamSink;
