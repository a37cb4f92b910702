//! Single-slot publication: latest frame, its name record, and metadata.
//!
//! None of these take a lock. There is one writer (the delivery thread) and
//! readers are expected to re-check: the latest slot is swapped before the
//! name record is rewritten, and the metadata record is overwritten field by
//! field from a reader's point of view.

use std::mem;

use tracing::{debug, info};

use crate::capture::frame::PixelLayout;
use crate::error::Result;
use crate::pipeline::shm::{self, SharedSegment, ShmNamespace, NAME_RECORD_LEN};

/// Publishes the newest frame under one well-known name
#[derive(Debug)]
pub struct LatestFramePublisher {
    slot_name: String,
    record_name: String,
    slot: Option<SharedSegment>,
    record: Option<SharedSegment>,
}

impl LatestFramePublisher {
    pub fn new(namespace: &ShmNamespace) -> Self {
        Self {
            slot_name: namespace.latest(),
            record_name: namespace.latest_name(),
            slot: None,
            record: None,
        }
    }

    /// Replace the published frame.
    ///
    /// The previous occupant is always released first. On failure the slot
    /// stays absent until the next successful publication.
    pub fn publish(&mut self, layout: &PixelLayout, data: &[u8]) -> Result<()> {
        layout.check_len(data)?;
        if let Some(mut previous) = self.slot.take() {
            previous.release();
        }

        let mut segment = SharedSegment::replace(&self.slot_name, layout.byte_size())?;
        layout.copy_packed(data, segment.as_mut_slice());
        self.slot = Some(segment);

        self.write_name_record()
    }

    fn write_name_record(&mut self) -> Result<()> {
        if self.record.is_none() {
            self.record = Some(SharedSegment::replace(&self.record_name, NAME_RECORD_LEN)?);
        }
        if let Some(record) = self.record.as_mut() {
            let buf = record.as_mut_slice();
            let name = self.slot_name.as_bytes();
            let len = name.len().min(NAME_RECORD_LEN - 1);
            buf[..len].copy_from_slice(&name[..len]);
            buf[len..].fill(0);
        }
        Ok(())
    }

    /// Whether a frame is currently published
    pub fn is_published(&self) -> bool {
        self.slot.is_some()
    }

    pub fn slot_name(&self) -> &str {
        &self.slot_name
    }

    pub fn teardown(&mut self) {
        if let Some(mut slot) = self.slot.take() {
            slot.release();
        }
        if let Some(mut record) = self.record.take() {
            record.release();
        }
    }
}

impl Drop for LatestFramePublisher {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Resolve the latest frame's segment name the way an outside reader does
pub fn read_name_record(namespace: &ShmNamespace) -> Result<Option<String>> {
    let Some(bytes) = shm::read(&namespace.latest_name())? else {
        return Ok(None);
    };
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    Ok(Some(String::from_utf8_lossy(&bytes[..end]).into_owned()))
}

/// Geometry of the latest frame as exposed in `<prefix>_metadata`.
///
/// Matches the C layout `{ uint32 tag; uint32 width; uint32 height; size_t size; }`
/// on 64-bit hosts, native endian.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetadataRecord {
    pub layout_tag: u32,
    pub width: u32,
    pub height: u32,
    pub size: u64,
}

/// Encoded size of [`MetadataRecord`], padding included
pub const METADATA_LEN: usize = 24;

const _: () = assert!(mem::size_of::<MetadataRecord>() == METADATA_LEN);

impl MetadataRecord {
    pub fn from_layout(layout: &PixelLayout) -> Self {
        Self {
            layout_tag: layout.tag(),
            width: layout.width(),
            height: layout.height(),
            size: layout.byte_size() as u64,
        }
    }

    pub fn to_bytes(&self) -> [u8; METADATA_LEN] {
        let mut out = [0u8; METADATA_LEN];
        out[0..4].copy_from_slice(&self.layout_tag.to_ne_bytes());
        out[4..8].copy_from_slice(&self.width.to_ne_bytes());
        out[8..12].copy_from_slice(&self.height.to_ne_bytes());
        out[16..24].copy_from_slice(&self.size.to_ne_bytes());
        out
    }

    pub fn read_from(bytes: &[u8]) -> Option<Self> {
        let bytes = bytes.get(..METADATA_LEN)?;
        let u32_at = |at: usize| bytes[at..at + 4].try_into().ok().map(u32::from_ne_bytes);
        Some(Self {
            layout_tag: u32_at(0)?,
            width: u32_at(4)?,
            height: u32_at(8)?,
            size: bytes[16..24].try_into().ok().map(u64::from_ne_bytes)?,
        })
    }
}

/// Owns the metadata segment for the process lifetime
#[derive(Debug)]
pub struct MetadataPublisher {
    segment: SharedSegment,
    current: MetadataRecord,
}

impl MetadataPublisher {
    /// Create and zero the record. Failing here is a setup failure.
    pub fn create(namespace: &ShmNamespace) -> Result<Self> {
        let mut segment = SharedSegment::replace(&namespace.metadata(), METADATA_LEN)?;
        let current = MetadataRecord::default();
        segment.as_mut_slice().copy_from_slice(&current.to_bytes());
        info!(name = segment.name(), "metadata record ready");
        Ok(Self { segment, current })
    }

    /// Overwrite the whole record in place
    pub fn publish(&mut self, record: MetadataRecord) {
        if self.segment.is_released() {
            debug!("metadata record already torn down");
            return;
        }
        self.segment.as_mut_slice().copy_from_slice(&record.to_bytes());
        self.current = record;
    }

    pub fn current(&self) -> MetadataRecord {
        self.current
    }

    pub fn name(&self) -> &str {
        self.segment.name()
    }

    pub fn teardown(&mut self) {
        self.segment.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::{FrameDescriptor, TAG_BGR8888, TAG_YCBYCR};
    use crate::pipeline::shm::tests::namespace;

    #[test]
    fn test_latest_replaces_previous() {
        let ns = namespace("latest_pub");
        let mut publisher = LatestFramePublisher::new(&ns);
        let small = PixelLayout::decode(TAG_YCBYCR, FrameDescriptor::new(2, 1, 4)).unwrap();
        let large = PixelLayout::decode(TAG_YCBYCR, FrameDescriptor::new(4, 1, 8)).unwrap();

        publisher.publish(&small, &[1, 2, 3, 4]).unwrap();
        assert_eq!(&shm::read(&ns.latest()).unwrap().unwrap()[..], &[1, 2, 3, 4]);

        publisher.publish(&large, &[9, 8, 7, 6, 5, 4, 3, 2]).unwrap();
        assert_eq!(
            &shm::read(&ns.latest()).unwrap().unwrap()[..],
            &[9, 8, 7, 6, 5, 4, 3, 2]
        );
        assert!(publisher.is_published());
    }

    #[test]
    fn test_name_record_resolves_slot() {
        let ns = namespace("name_record");
        let mut publisher = LatestFramePublisher::new(&ns);
        assert_eq!(read_name_record(&ns).unwrap(), None);

        let layout = PixelLayout::decode(TAG_BGR8888, FrameDescriptor::new(1, 1, 4)).unwrap();
        publisher.publish(&layout, &[1, 2, 3, 4]).unwrap();

        let record = shm::read(&ns.latest_name()).unwrap().unwrap();
        assert_eq!(record.len(), NAME_RECORD_LEN);
        let name = read_name_record(&ns).unwrap().unwrap();
        assert_eq!(name, ns.latest());
        assert_eq!(&shm::read(&name).unwrap().unwrap()[..], &[1, 2, 3, 4]);

        publisher.teardown();
        publisher.teardown();
        assert!(!shm::exists(&ns.latest()));
        assert!(!shm::exists(&ns.latest_name()));
    }

    #[test]
    fn test_metadata_record_layout() {
        let record = MetadataRecord {
            layout_tag: 3,
            width: 640,
            height: 480,
            size: 640 * 480 * 4,
        };
        let bytes = record.to_bytes();
        assert_eq!(&bytes[4..8], &640u32.to_ne_bytes());
        assert_eq!(&bytes[12..16], &[0, 0, 0, 0]);
        assert_eq!(MetadataRecord::read_from(&bytes), Some(record));
        assert_eq!(MetadataRecord::read_from(&bytes[..10]), None);
    }

    #[test]
    fn test_metadata_publish_overwrites() {
        let ns = namespace("metadata");
        let mut publisher = MetadataPublisher::create(&ns).unwrap();
        let seen = shm::read(&ns.metadata()).unwrap().unwrap();
        assert_eq!(MetadataRecord::read_from(&seen), Some(MetadataRecord::default()));

        let layout = PixelLayout::decode(TAG_YCBYCR, FrameDescriptor::new(320, 240, 640)).unwrap();
        publisher.publish(MetadataRecord::from_layout(&layout));

        let seen = MetadataRecord::read_from(&shm::read(&ns.metadata()).unwrap().unwrap()).unwrap();
        assert_eq!(seen.layout_tag, TAG_YCBYCR);
        assert_eq!((seen.width, seen.height, seen.size), (320, 240, 320 * 240 * 2));

        publisher.teardown();
        publisher.teardown();
        assert!(!shm::exists(&ns.metadata()));
    }
}
