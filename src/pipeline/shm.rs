//! Named POSIX shared memory segments.
//!
//! A [`SharedSegment`] owns one name and one writable mapping. Releasing it
//! unmaps and unlinks exactly once, whether through [`SharedSegment::release`]
//! or on drop, so every exit path (including a failed create) leaves nothing
//! behind.

use std::fs::File;

use bytes::Bytes;
use memmap2::{MmapMut, MmapOptions};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use tracing::{trace, warn};

use crate::error::{PipelineError, Result, ShmOp};

/// Length of the record that holds the latest segment's name
pub const NAME_RECORD_LEN: usize = 256;

/// Naming scheme for every segment the pipeline publishes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmNamespace {
    prefix: String,
}

impl ShmNamespace {
    /// `prefix` must look like a POSIX shm name: a leading `/` and no other `/`.
    pub fn new(prefix: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        let valid = prefix.len() > 1
            && prefix.starts_with('/')
            && !prefix[1..].contains('/')
            && !prefix.contains('\0')
            // leave room for the longest suffix inside the name record
            && prefix.len() + "_latest_name".len() < NAME_RECORD_LEN;
        if !valid {
            return Err(PipelineError::InvalidShmName(prefix));
        }
        Ok(Self { prefix })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn frame_slot(&self, index: usize) -> String {
        format!("{}_frame_{}", self.prefix, index)
    }

    pub fn latest(&self) -> String {
        format!("{}_latest", self.prefix)
    }

    pub fn latest_name(&self) -> String {
        format!("{}_latest_name", self.prefix)
    }

    pub fn metadata(&self) -> String {
        format!("{}_metadata", self.prefix)
    }
}

impl Default for ShmNamespace {
    fn default() -> Self {
        Self {
            prefix: "/camera".into(),
        }
    }
}

/// Unlinks a freshly created name unless the create succeeds
struct UnlinkGuard<'a> {
    name: &'a str,
    armed: bool,
}

impl Drop for UnlinkGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = shm_unlink(self.name);
        }
    }
}

/// Single-owner handle to a named, mapped shared memory segment
#[derive(Debug)]
pub struct SharedSegment {
    name: String,
    map: Option<MmapMut>,
}

impl SharedSegment {
    /// Open (creating if needed) `name`, truncate it to `len` bytes and map it
    /// read/write.
    pub fn create(name: &str, len: usize) -> Result<Self> {
        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::from_bits_truncate(0o666),
        )
        .map_err(|e| PipelineError::shm(name, ShmOp::Open, e))?;
        let mut guard = UnlinkGuard { name, armed: true };

        let file = File::from(fd);
        file.set_len(len as u64)
            .map_err(|e| PipelineError::shm(name, ShmOp::Truncate, e))?;

        // SAFETY: the segment is only resized through this handle, and other
        // processes map it read-only by convention.
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file) }
            .map_err(|e| PipelineError::shm(name, ShmOp::Map, e))?;

        guard.armed = false;
        trace!(name, len, "created shared segment");
        Ok(Self {
            name: name.to_owned(),
            map: Some(map),
        })
    }

    /// Unlink whatever is currently published under `name`, then create a
    /// fresh segment. A reader still mapping the old object keeps its bytes;
    /// it is never resized in place.
    pub fn replace(name: &str, len: usize) -> Result<Self> {
        remove(name)?;
        Self::create(name, len)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.map.as_ref().map_or(0, |m| m.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_released(&self) -> bool {
        self.map.is_none()
    }

    pub fn as_slice(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.map.as_deref_mut().unwrap_or(&mut [])
    }

    /// Unmap and unlink. Safe to call any number of times.
    pub fn release(&mut self) {
        let Some(map) = self.map.take() else {
            return;
        };
        drop(map);
        match shm_unlink(self.name.as_str()) {
            Ok(()) | Err(Errno::ENOENT) => trace!(name = %self.name, "released shared segment"),
            Err(e) => warn!(name = %self.name, "shm_unlink failed: {}", e),
        }
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        self.release();
    }
}

/// Whether a segment with this name currently exists
pub fn exists(name: &str) -> bool {
    shm_open(name, OFlag::O_RDONLY, Mode::empty()).is_ok()
}

/// Copy out the whole content of a published segment, the way an external
/// reader would see it. Returns `None` when the name does not resolve.
pub fn read(name: &str) -> Result<Option<Bytes>> {
    let fd = match shm_open(name, OFlag::O_RDONLY, Mode::empty()) {
        Ok(fd) => fd,
        Err(Errno::ENOENT) => return Ok(None),
        Err(e) => return Err(PipelineError::shm(name, ShmOp::Open, e)),
    };
    let file = File::from(fd);
    let len = file
        .metadata()
        .map_err(|e| PipelineError::shm(name, ShmOp::Map, e))?
        .len() as usize;
    if len == 0 {
        return Ok(Some(Bytes::new()));
    }
    // SAFETY: read-only mapping, copied out before it is dropped.
    let map = unsafe { MmapOptions::new().len(len).map(&file) }
        .map_err(|e| PipelineError::shm(name, ShmOp::Map, e))?;
    Ok(Some(Bytes::copy_from_slice(&map)))
}

/// Unlink a leftover segment, ignoring names that do not exist
pub fn remove(name: &str) -> Result<()> {
    match shm_unlink(name) {
        Ok(()) | Err(Errno::ENOENT) => Ok(()),
        Err(e) => Err(PipelineError::shm(name, ShmOp::Unlink, e)),
    }
}
