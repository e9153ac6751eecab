//! kvpool Allocator - per-segment buffer management
//!
//! This crate provides:
//! - A best-fit free-list allocator over a segment's remote byte range
//! - RAII buffer handles that return their range when dropped
//!
//! The allocator never touches the memory it manages; it only carves up
//! the address range a client announced at mount time. Handles hold a
//! weak reference to their allocator, so tearing an allocator down
//! (dropping its last `Arc`) invalidates outstanding handles instead of
//! leaking or double-freeing ranges.

mod buffer;

pub use buffer::AllocatedBuffer;

use kvpool_common::{Segment, SegmentId};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Best-fit allocator over a contiguous remote address range.
///
/// Free regions are kept in an offset-ordered map and coalesced on
/// free. `allocate` picks the smallest region that fits, which keeps
/// large regions intact for large slices.
pub struct BufferAllocator {
    /// Back-reference handed to every buffer; dead once the segment
    /// table drops its `Arc`
    self_weak: Weak<BufferAllocator>,
    segment_id: SegmentId,
    segment_name: String,
    base: u64,
    capacity: u64,
    /// offset (relative to base) -> region length
    free_list: Mutex<BTreeMap<u64, u64>>,
    /// Bytes currently handed out (cached)
    used: AtomicU64,
}

impl BufferAllocator {
    /// Create an allocator covering the whole of `segment`
    #[must_use]
    pub fn new(segment: &Segment) -> Arc<Self> {
        let mut free_list = BTreeMap::new();
        if segment.size > 0 {
            free_list.insert(0, segment.size);
        }
        Arc::new_cyclic(|self_weak| Self {
            self_weak: self_weak.clone(),
            segment_id: segment.id,
            segment_name: segment.name.clone(),
            base: segment.base,
            capacity: segment.size,
            free_list: Mutex::new(free_list),
            used: AtomicU64::new(0),
        })
    }

    /// Segment this allocator serves
    #[must_use]
    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    /// Transport name of the segment
    #[must_use]
    pub fn segment_name(&self) -> &str {
        &self.segment_name
    }

    /// Total bytes managed
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes currently handed out
    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    /// Bytes available for allocation
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.capacity - self.used_bytes()
    }

    /// Reserve `size` bytes, returning a handle that frees the range on
    /// drop. Returns `None` when no free region fits.
    pub fn allocate(&self, size: u64) -> Option<AllocatedBuffer> {
        if size == 0 || size > self.capacity {
            return None;
        }

        let mut free_list = self.free_list.lock();

        // Best fit: smallest region that still fits
        let (&offset, &len) = free_list
            .iter()
            .filter(|(_, &len)| len >= size)
            .min_by_key(|(_, &len)| len)?;

        free_list.remove(&offset);
        if len > size {
            free_list.insert(offset + size, len - size);
        }
        self.used.fetch_add(size, Ordering::Relaxed);

        Some(AllocatedBuffer::new(
            self.self_weak.clone(),
            self.segment_id,
            self.segment_name.clone(),
            self.base + offset,
            size,
        ))
    }

    /// Return a range to the free list, coalescing with neighbors.
    ///
    /// `remote_address` is the absolute address the handle carries.
    pub(crate) fn free(&self, remote_address: u64, size: u64) {
        debug_assert!(remote_address >= self.base);
        let mut offset = remote_address - self.base;
        let mut len = size;

        let mut free_list = self.free_list.lock();

        // Merge with the preceding region if adjacent
        if let Some((&prev_off, &prev_len)) = free_list.range(..offset).next_back() {
            debug_assert!(prev_off + prev_len <= offset, "double free detected");
            if prev_off + prev_len == offset {
                free_list.remove(&prev_off);
                offset = prev_off;
                len += prev_len;
            }
        }

        // Merge with the following region if adjacent
        if let Some((&next_off, &next_len)) = free_list.range(offset + len..).next() {
            if offset + len == next_off {
                free_list.remove(&next_off);
                len += next_len;
            }
        }

        free_list.insert(offset, len);
        self.used.fetch_sub(size, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for BufferAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferAllocator")
            .field("segment_id", &self.segment_id)
            .field("segment_name", &self.segment_name)
            .field("capacity", &self.capacity)
            .field("used", &self.used_bytes())
            .finish()
    }
}
