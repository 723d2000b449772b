//! Shared-memory segments.
//!
//! The dataplane names segments by an opaque 64-bit handle. Each segment the
//! process maps gets a local index; the [`SegmentTable`] resolves one to the
//! other and is shared by all workers.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::ptr::NonNull;
use std::sync::{PoisonError, RwLock};

use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap};
use tracing::{debug, info, warn};

use crate::error::{Result, VclError};
use crate::pool::Pool;

/// Returned by lookups for unmapped segments.
pub const INVALID_SEGMENT_INDEX: u32 = u32::MAX;

/// Sentinel dataplane segment handle.
pub const INVALID_SEGMENT_HANDLE: u64 = u64::MAX;

/// Process-wide map from dataplane segment handle to local segment index.
///
/// Lookups take the read lock, add and delete take the write lock.
#[derive(Debug, Default)]
pub struct SegmentTable {
    table: RwLock<HashMap<u64, u32>>,
}

impl SegmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `segment_handle` to `segment_index`, replacing any previous entry.
    pub fn add(&self, segment_handle: u64, segment_index: u32) {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(prev) = table.insert(segment_handle, segment_index)
            && prev != segment_index
        {
            warn!(
                segment_handle = %format_args!("{segment_handle:#x}"),
                prev, segment_index, "Segment handle remapped"
            );
        }
    }

    /// Local index for `segment_handle`, or [`INVALID_SEGMENT_INDEX`].
    pub fn lookup(&self, segment_handle: u64) -> u32 {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&segment_handle)
            .copied()
            .unwrap_or(INVALID_SEGMENT_INDEX)
    }

    pub fn del(&self, segment_handle: u64) -> Option<u32> {
        self.table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&segment_handle)
    }

    pub fn len(&self) -> usize {
        self.table.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A segment mapped into this process.
pub struct MappedSegment {
    pub handle: u64,
    pub name: String,
    ptr: NonNull<u8>,
    size: usize,
}

// Safety: the mapping is process-global and only unmapped on drop
unsafe impl Send for MappedSegment {}
unsafe impl Sync for MappedSegment {}

impl MappedSegment {
    /// Map `size` bytes of `fd` shared and read-write.
    pub fn map<F: AsFd>(handle: u64, name: &str, fd: F, size: usize) -> Result<Self> {
        let len = NonZeroUsize::new(size)
            .ok_or_else(|| VclError::InvalidArgument("zero-sized segment".to_string()))?;
        let ptr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )?
        };
        Ok(MappedSegment {
            handle,
            name: name.to_string(),
            ptr: ptr.cast(),
            size,
        })
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl std::fmt::Debug for MappedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedSegment")
            .field("handle", &format_args!("{:#x}", self.handle))
            .field("name", &self.name)
            .field("size", &self.size)
            .finish()
    }
}

impl Drop for MappedSegment {
    fn drop(&mut self) {
        if let Err(e) = unsafe { munmap(self.ptr.cast(), self.size) } {
            warn!(segment_name = %self.name, error = %e, "Failed to unmap segment");
        }
    }
}

/// Mapped segments plus the handle table that indexes them.
#[derive(Debug)]
pub struct SegmentManager {
    segments: RwLock<Pool<MappedSegment>>,
    table: SegmentTable,
}

impl SegmentManager {
    pub fn new(max_segments: u32) -> Self {
        SegmentManager {
            segments: RwLock::new(Pool::with_capacity_limit(max_segments)),
            table: SegmentTable::new(),
        }
    }

    pub fn table(&self) -> &SegmentTable {
        &self.table
    }

    /// Map a segment announced by the dataplane and index it.
    pub fn attach<F: AsFd>(&self, handle: u64, name: &str, fd: F, size: usize) -> Result<u32> {
        let segment = MappedSegment::map(handle, name, fd, size)?;
        let index = {
            let mut segments = self.segments.write().unwrap_or_else(PoisonError::into_inner);
            segments
                .insert_with(move |_| segment)
                .ok_or(VclError::SegmentTableFull)?
        };
        self.table.add(handle, index);
        info!(
            segment_handle = %format_args!("{handle:#x}"),
            segment_index = index,
            segment_name = name,
            size,
            "Mapped segment"
        );
        Ok(index)
    }

    /// Drop the table entry first so new lookups miss, then unmap.
    pub fn detach(&self, handle: u64) -> Result<()> {
        let index = self
            .table
            .del(handle)
            .ok_or(VclError::UnknownSegment(handle))?;
        let removed = self
            .segments
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(index);
        debug!(
            segment_handle = %format_args!("{handle:#x}"),
            segment_index = index,
            unmapped = removed.is_some(),
            "Detached segment"
        );
        Ok(())
    }

    /// True if `handle` resolves to a mapped segment.
    pub fn is_mapped(&self, handle: u64) -> bool {
        self.table.lookup(handle) != INVALID_SEGMENT_INDEX
    }

    pub fn with_segment<R>(&self, handle: u64, f: impl FnOnce(&MappedSegment) -> R) -> Option<R> {
        let index = self.table.lookup(handle);
        if index == INVALID_SEGMENT_INDEX {
            return None;
        }
        let segments = self.segments.read().unwrap_or_else(PoisonError::into_inner);
        segments.get(index).map(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_segment_table_roundtrip() {
        let table = SegmentTable::new();
        for (handle, idx) in [(0u64, 0u32), (0x1_0000_0001, 7), (u64::MAX - 1, 42)] {
            table.add(handle, idx);
            assert_eq!(table.lookup(handle), idx);
            assert_eq!(table.del(handle), Some(idx));
            assert_eq!(table.lookup(handle), INVALID_SEGMENT_INDEX);
        }
        assert!(table.is_empty());
    }

    #[test]
    fn test_segment_table_concurrent_lookups() {
        let table = Arc::new(SegmentTable::new());
        table.add(1, 10);

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let table = table.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let idx = table.lookup(1);
                        assert!(idx == 10 || idx == INVALID_SEGMENT_INDEX);
                    }
                })
            })
            .collect();

        table.del(1);
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(table.lookup(1), INVALID_SEGMENT_INDEX);
    }

    #[test]
    fn test_attach_detach_file_segment() {
        let file = tempfile::tempfile().unwrap();
        file.set_len(4096).unwrap();

        let manager = SegmentManager::new(4);
        let idx = manager.attach(0x55, "seg-test", &file, 4096).unwrap();
        assert_eq!(manager.table().lookup(0x55), idx);
        assert_eq!(manager.with_segment(0x55, |s| s.size()), Some(4096));

        manager
            .with_segment(0x55, |s| unsafe { *s.ptr() = 0xa5 })
            .unwrap();
        assert_eq!(manager.with_segment(0x55, |s| unsafe { *s.ptr() }), Some(0xa5));

        manager.detach(0x55).unwrap();
        assert!(!manager.is_mapped(0x55));
        assert!(matches!(
            manager.detach(0x55),
            Err(VclError::UnknownSegment(0x55))
        ));
    }

    #[test]
    fn test_segment_limit() {
        let file = tempfile::tempfile().unwrap();
        file.set_len(4096).unwrap();
        let manager = SegmentManager::new(1);
        manager.attach(1, "a", &file, 4096).unwrap();
        assert!(matches!(
            manager.attach(2, "b", &file, 4096),
            Err(VclError::SegmentTableFull)
        ));
    }
}
