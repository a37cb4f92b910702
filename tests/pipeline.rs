//! End-to-end ingestion tests
//!
//! Frames go through the orchestrator exactly as a driver would deliver them;
//! results are checked through shared memory the way an outside reader sees
//! them.

use std::io::{self, Write};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use camshm::capture::frame::{TAG_BGR8888, TAG_CBYCRY, TAG_RGB8888, TAG_YCBYCR};
use camshm::capture::{LayoutKind, TestPattern};
use camshm::pipeline::ingest::{FrameOutcome, Stage, StatusReport};
use camshm::pipeline::publish::{read_name_record, MetadataRecord};
use camshm::pipeline::shm::{self, ShmNamespace};
use camshm::pipeline::stream::PREFIX_LEN;
use camshm::pipeline::{IngestContext, Ingestor};
use camshm::{Config, FrameDescriptor, PipelineError, RawFrame};

/// Transport that keeps everything written, shared with the test
#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Transport whose peer has gone away
struct Disconnected;

impl Write for Disconnected {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::from(io::ErrorKind::ConnectionReset))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn namespace(test: &str) -> ShmNamespace {
    ShmNamespace::new(format!("/camshm_it_{}_{}", std::process::id(), test)).unwrap()
}

/// Holds a directory where a segment would go, so creating it fails
struct Blocked(std::path::PathBuf);

impl Blocked {
    fn new(name: &str) -> Self {
        let path = std::path::PathBuf::from(format!("/dev/shm{name}"));
        std::fs::create_dir(&path).unwrap();
        Self(path)
    }
}

impl Drop for Blocked {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir(&self.0);
    }
}

fn config(ns: &ShmNamespace) -> Config {
    let mut config = Config::default();
    config.shm.prefix = ns.prefix().to_owned();
    config
}

fn ingestor<W: Write>(ns: &ShmNamespace, writer: Option<W>) -> Ingestor<W> {
    Ingestor::new(IngestContext::from_config(&config(ns), writer).unwrap())
}

fn rgb_frame(n: u8) -> Vec<u8> {
    // 4x2, stride 20 (4 bytes of padding per row)
    let mut data = Vec::new();
    for y in 0..2u8 {
        for x in 0..4u8 {
            data.extend_from_slice(&[n, x * 10, y * 10, 0xFF]);
        }
        data.extend_from_slice(&[0xAA; 4]);
    }
    data
}

fn rgb_raw(data: &[u8]) -> RawFrame<'_> {
    RawFrame {
        tag: TAG_RGB8888,
        desc: FrameDescriptor::new(4, 2, 20),
        data,
    }
}

fn split_frames(wire: &[u8]) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    let mut rest = wire;
    while !rest.is_empty() {
        let len = u64::from_ne_bytes(rest[..PREFIX_LEN].try_into().unwrap()) as usize;
        frames.push(rest[PREFIX_LEN..PREFIX_LEN + len].to_vec());
        rest = &rest[PREFIX_LEN + len..];
    }
    frames
}

#[test]
fn test_ring_holds_most_recent_frames() {
    let ns = namespace("ring");
    let mut ingestor = ingestor::<Captured>(&ns, None);

    for n in 0..12u8 {
        ingestor.on_frame(rgb_raw(&rgb_frame(n)));
    }

    let store = ingestor.store();
    assert_eq!(store.len(), store.capacity());
    let sequences: Vec<u64> = store.resident().iter().map(|f| f.sequence).collect();
    assert_eq!(sequences, vec![7, 8, 9, 10, 11]);

    // Latest is bit-for-bit the last frame, rows packed
    let delivered =
        camshm::PixelLayout::decode(TAG_RGB8888, FrameDescriptor::new(4, 2, 20)).unwrap();
    let mut expected = vec![0u8; delivered.byte_size()];
    delivered.copy_packed(&rgb_frame(11), &mut expected);

    let (layout, bytes) = store.latest_snapshot().unwrap();
    assert_eq!(layout, delivered.packed());
    assert_eq!(&bytes[..], &expected[..]);

    ingestor.teardown();
}

#[test]
fn test_latest_resolvable_through_name_record() {
    let ns = namespace("resolve");
    let mut ingestor = ingestor::<Captured>(&ns, None);
    ingestor.on_frame(rgb_raw(&rgb_frame(1)));
    ingestor.on_frame(rgb_raw(&rgb_frame(2)));

    let meta = MetadataRecord::read_from(&shm::read(&ns.metadata()).unwrap().unwrap()).unwrap();
    assert_eq!(
        meta,
        MetadataRecord {
            layout_tag: TAG_RGB8888,
            width: 4,
            height: 2,
            size: 32
        }
    );

    let name = read_name_record(&ns).unwrap().unwrap();
    let latest = shm::read(&name).unwrap().unwrap();
    assert_eq!(latest.len() as u64, meta.size);
    assert_eq!(&latest[..4], &[2, 0, 0, 0xFF]);

    ingestor.teardown();
    assert!(read_name_record(&ns).unwrap().is_none());
}

#[test]
fn test_unsupported_layout_touches_nothing() {
    let ns = namespace("unsupported");
    let wire = Captured::default();
    let (tx, rx) = flume::bounded(8);
    let mut ingestor = ingestor(&ns, Some(wire.clone())).with_status(tx);

    ingestor.on_frame(rgb_raw(&rgb_frame(3)));
    let before = shm::read(&ns.metadata()).unwrap().unwrap();
    let sent_before = wire.0.lock().unwrap().len();
    let _ = rx.drain().count();

    let outcome = ingestor.on_frame(RawFrame {
        tag: 77,
        desc: FrameDescriptor::new(4, 2, 16),
        data: &[0u8; 32],
    });

    assert!(matches!(
        outcome,
        FrameOutcome::Skipped(PipelineError::UnsupportedLayout(77))
    ));
    assert_eq!(shm::read(&ns.metadata()).unwrap().unwrap(), before);
    assert_eq!(wire.0.lock().unwrap().len(), sent_before);
    assert_eq!(ingestor.store().len(), 1);
    assert_eq!(rx.try_recv().unwrap(), StatusReport::Unsupported { tag: 77 });

    // The next good frame goes through as usual
    assert!(matches!(
        ingestor.on_frame(rgb_raw(&rgb_frame(4))),
        FrameOutcome::Processed(_)
    ));
    ingestor.teardown();
}

#[test]
fn test_stream_framing_over_captured_transport() {
    let ns = namespace("framing");
    let wire = Captured::default();
    let mut ingestor = ingestor(&ns, Some(wire.clone()));

    let mut lengths = Vec::new();
    for n in 0..3u8 {
        match ingestor.on_frame(rgb_raw(&rgb_frame(n * 50))) {
            FrameOutcome::Processed(frame) => lengths.push(frame.streamed.unwrap()),
            FrameOutcome::Skipped(e) => panic!("frame skipped: {e}"),
        }
    }
    // Chroma frames are published but never streamed
    ingestor.on_frame(RawFrame {
        tag: TAG_YCBYCR,
        desc: FrameDescriptor::new(2, 1, 4),
        data: &[1, 2, 3, 4],
    });

    let bytes = wire.0.lock().unwrap().clone();
    let frames = split_frames(&bytes);
    assert_eq!(frames.iter().map(Vec::len).collect::<Vec<_>>(), lengths);
    for payload in &frames {
        let mut decoder = jpeg_decoder::Decoder::new(payload.as_slice());
        decoder.decode().unwrap();
        let info = decoder.info().unwrap();
        assert_eq!((info.width, info.height), (4, 2));
    }
    ingestor.teardown();
}

#[test]
fn test_bgr_frames_are_published_not_streamed() {
    let ns = namespace("bgr_stream");
    let wire = Captured::default();
    let mut ingestor = ingestor(&ns, Some(wire.clone()));

    let outcome = ingestor.on_frame(RawFrame {
        tag: TAG_BGR8888,
        desc: FrameDescriptor::new(2, 1, 8),
        data: &[10, 20, 30, 99, 40, 50, 60, 99],
    });
    let FrameOutcome::Processed(frame) = outcome else {
        panic!("frame skipped");
    };
    assert_eq!(frame.streamed, None);
    assert!(frame.failures.is_empty());
    assert!(frame.latest_published);
    assert_eq!(frame.averages.values, [45.0, 35.0, 25.0]);
    assert!(wire.0.lock().unwrap().is_empty());
    ingestor.teardown();
}

#[test]
fn test_broken_transport_does_not_stop_ingestion() {
    let ns = namespace("broken");
    let mut ingestor = ingestor(&ns, Some(Disconnected));

    for n in 0..7u8 {
        let FrameOutcome::Processed(frame) = ingestor.on_frame(rgb_raw(&rgb_frame(n))) else {
            panic!("frame skipped");
        };
        assert_eq!(frame.failures.len(), 1);
        assert_eq!(frame.failures[0].stage, Stage::Stream);
        assert!(frame.sequence.is_some());
        assert!(frame.latest_published);
        assert_eq!(frame.averages.values[0], f64::from(n));
    }

    let sink = ingestor.context().stream.as_ref().unwrap();
    assert_eq!(sink.send_failures(), 7);
    assert_eq!(ingestor.store().len(), 5);
    ingestor.teardown();
}

#[test]
fn test_store_failure_is_contained() {
    let ns = namespace("store_fails");
    let wire = Captured::default();
    let mut ingestor = ingestor(&ns, Some(wire.clone()));
    ingestor.on_frame(rgb_raw(&rgb_frame(1)));

    // Slot 1 cannot be created; the frame still reaches every other stage
    let blocked = Blocked::new(&ns.frame_slot(1));
    let FrameOutcome::Processed(frame) = ingestor.on_frame(rgb_raw(&rgb_frame(2))) else {
        panic!("frame skipped");
    };
    assert_eq!(frame.failures.len(), 1);
    assert_eq!(frame.failures[0].stage, Stage::Store);
    assert_eq!(frame.averages.values[0], 2.0);

    let store = ingestor.store();
    assert_eq!(store.len(), 1);
    assert_eq!(store.stats().dropped, 1);
    let name = read_name_record(&ns).unwrap().unwrap();
    assert_eq!(&shm::read(&name).unwrap().unwrap()[..4], &[2, 0, 0, 0xFF]);
    let meta = MetadataRecord::read_from(&shm::read(&ns.metadata()).unwrap().unwrap()).unwrap();
    assert_eq!(meta.size, 32);
    assert_eq!(split_frames(&wire.0.lock().unwrap()).len(), 2);

    drop(blocked);
    ingestor.on_frame(rgb_raw(&rgb_frame(3)));
    assert_eq!(ingestor.store().len(), 2);
    ingestor.teardown();
}

#[test]
fn test_chroma_averages_through_pipeline() {
    let ns = namespace("chroma");
    let mut ingestor = ingestor::<Captured>(&ns, None);

    let FrameOutcome::Processed(frame) = ingestor.on_frame(RawFrame {
        tag: TAG_CBYCRY,
        desc: FrameDescriptor::new(2, 1, 6),
        data: &[60, 100, 90, 200, 0xEE, 0xEE],
    }) else {
        panic!("frame skipped");
    };
    assert_eq!(frame.averages.values, [150.0, 60.0, 90.0]);
    assert_eq!(ingestor.context().metadata.current().size, 4);
    ingestor.teardown();
}

#[test]
fn test_teardown_twice_releases_everything() {
    let ns = namespace("teardown");
    let mut ingestor = ingestor::<Captured>(&ns, None);
    for n in 0..3u8 {
        ingestor.on_frame(rgb_raw(&rgb_frame(n)));
    }

    ingestor.teardown();
    ingestor.teardown();

    for slot in 0..5 {
        assert!(!shm::exists(&ns.frame_slot(slot)));
    }
    assert!(!shm::exists(&ns.latest()));
    assert!(!shm::exists(&ns.latest_name()));
    assert!(!shm::exists(&ns.metadata()));
}

#[test]
fn test_delivery_thread_runs_source_to_completion() {
    let ns = namespace("delivery");
    let wire = Captured::default();
    let ingestor = ingestor(&ns, Some(wire.clone()));
    let source = TestPattern::new(LayoutKind::Rgb8888, 8, 4, 16, 1000)
        .unwrap()
        .with_frame_limit(9);

    let stop = Arc::new(AtomicBool::new(false));
    let (handle, _done) = ingestor.spawn(Box::new(source), stop, None).unwrap();
    let (mut ingestor, result) = handle.join().unwrap();
    result.unwrap();

    assert_eq!(ingestor.frames_seen(), 9);
    assert_eq!(ingestor.store().stats().evicted, 4);
    assert_eq!(split_frames(&wire.0.lock().unwrap()).len(), 9);
    ingestor.teardown();
}
