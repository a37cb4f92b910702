//! Fixed-capacity ring of frames, each backed by its own shared segment

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use crossbeam::utils::CachePadded;
use tracing::{debug, instrument};

use crate::capture::frame::PixelLayout;
use crate::error::{PipelineError, Result};
use crate::pipeline::shm::{SharedSegment, ShmNamespace};

/// Default number of frames kept resident
pub const DEFAULT_CAPACITY: usize = 5;

/// A resident frame. Owns its segment until evicted or torn down.
#[derive(Debug)]
pub struct Frame {
    layout: PixelLayout,
    sequence: u64,
    segment: SharedSegment,
}

impl Frame {
    /// Layout of the stored bytes (rows packed, so `stride == row_bytes`)
    pub fn layout(&self) -> &PixelLayout {
        &self.layout
    }

    /// Push order, starting at 0
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn size(&self) -> usize {
        self.segment.len()
    }

    pub fn name(&self) -> &str {
        self.segment.name()
    }

    pub fn data(&self) -> &[u8] {
        self.segment.as_slice()
    }
}

/// Where a resident frame lives in the ring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResidentFrame {
    pub sequence: u64,
    pub slot: usize,
    pub name: String,
    pub layout: PixelLayout,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub pushed: u64,
    pub evicted: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    pushed: AtomicU64,
    evicted: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug)]
struct Ring {
    slots: Vec<Option<Frame>>,
    head: usize,
    count: usize,
    next_sequence: u64,
}

/// Bounded FIFO-eviction frame cache.
///
/// A single mutex guards the ring; `push` and `latest` exclude each other.
/// Slot `i` is always published under `<prefix>_frame_<i>`, so names are
/// reused as the ring wraps.
pub struct FrameStore {
    namespace: ShmNamespace,
    capacity: usize,
    ring: Mutex<Ring>,
    stats: CachePadded<Counters>,
}

impl FrameStore {
    pub fn new(namespace: ShmNamespace, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(PipelineError::InvalidConfig(
                "frame store capacity must be at least 1".into(),
            ));
        }
        Ok(Self {
            namespace,
            capacity,
            ring: Mutex::new(Ring {
                slots: (0..capacity).map(|_| None).collect(),
                head: 0,
                count: 0,
                next_sequence: 0,
            }),
            stats: CachePadded::new(Counters::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy a frame into the next slot, evicting the oldest frame when full.
    ///
    /// Returns the new frame's sequence number. If the segment cannot be
    /// created the frame is dropped and no partial frame becomes resident.
    #[instrument(level = "debug", skip(self, layout, data), fields(size = layout.byte_size()))]
    pub fn push(&self, layout: &PixelLayout, data: &[u8]) -> Result<u64> {
        layout.check_len(data)?;
        let mut ring = self.lock();

        if ring.count == self.capacity {
            let head = ring.head;
            if let Some(mut oldest) = ring.slots[head].take() {
                debug!(sequence = oldest.sequence, slot = head, "evicting frame");
                oldest.segment.release();
            }
            ring.head = (head + 1) % self.capacity;
            ring.count -= 1;
            self.stats.evicted.fetch_add(1, Ordering::Relaxed);
        }

        let index = (ring.head + ring.count) % self.capacity;
        // The slot name is about to be reused; the previous mapping goes first.
        if let Some(mut stale) = ring.slots[index].take() {
            stale.segment.release();
        }

        let name = self.namespace.frame_slot(index);
        let mut segment = match SharedSegment::replace(&name, layout.byte_size()) {
            Ok(segment) => segment,
            Err(e) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        layout.copy_packed(data, segment.as_mut_slice());

        let sequence = ring.next_sequence;
        ring.next_sequence += 1;
        ring.slots[index] = Some(Frame {
            layout: layout.packed(),
            sequence,
            segment,
        });
        ring.count += 1;
        self.stats.pushed.fetch_add(1, Ordering::Relaxed);
        Ok(sequence)
    }

    /// Run `read` against the most recent frame while holding the lock.
    ///
    /// The borrow cannot escape: the next `push` may evict or overwrite the
    /// slot. Use [`FrameStore::latest_snapshot`] to keep a copy.
    pub fn latest<R>(&self, read: impl FnOnce(&Frame) -> R) -> Option<R> {
        let ring = self.lock();
        if ring.count == 0 {
            return None;
        }
        let index = (ring.head + ring.count - 1) % self.capacity;
        ring.slots[index].as_ref().map(read)
    }

    /// Copy of the latest frame's layout and bytes
    pub fn latest_snapshot(&self) -> Option<(PixelLayout, Bytes)> {
        self.latest(|frame| (frame.layout, Bytes::copy_from_slice(frame.data())))
    }

    /// Resident frames, oldest first
    pub fn resident(&self) -> Vec<ResidentFrame> {
        let ring = self.lock();
        (0..ring.count)
            .map(|i| (ring.head + i) % self.capacity)
            .filter_map(|slot| {
                ring.slots[slot].as_ref().map(|frame| ResidentFrame {
                    sequence: frame.sequence,
                    slot,
                    name: frame.name().to_owned(),
                    layout: frame.layout,
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn namespace(&self) -> &ShmNamespace {
        &self.namespace
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            pushed: self.stats.pushed.load(Ordering::Relaxed),
            evicted: self.stats.evicted.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }

    /// Unmap and unlink every resident frame. Calling it again is a no-op.
    pub fn teardown(&self) {
        let mut ring = self.lock();
        let mut released = 0;
        for slot in ring.slots.iter_mut() {
            if let Some(mut frame) = slot.take() {
                frame.segment.release();
                released += 1;
            }
        }
        ring.head = 0;
        ring.count = 0;
        if released > 0 {
            debug!(released, "frame store torn down");
        }
    }
}

impl Drop for FrameStore {
    fn drop(&mut self) {
        self.teardown();
    }
}
