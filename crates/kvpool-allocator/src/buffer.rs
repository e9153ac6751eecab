//! RAII handle for one allocated range of a segment.

use crate::BufferAllocator;
use kvpool_common::{BufStatus, BufferDescriptor, SegmentId};
use std::fmt;
use std::sync::Weak;

/// One reserved sub-range of a segment, owned by exactly one replica.
///
/// The handle keeps only a weak reference to its allocator: the segment
/// table owns the allocator, and unmounting a segment drops it. A
/// handle whose allocator is gone reports [`BufStatus::Unregistered`]
/// and becomes a no-op on drop; the metadata sweep removes the replicas
/// that contain such handles.
pub struct AllocatedBuffer {
    pool: Weak<BufferAllocator>,
    segment_id: SegmentId,
    segment_name: String,
    remote_address: u64,
    size: u64,
    status: BufStatus,
}

impl AllocatedBuffer {
    pub(crate) fn new(
        pool: Weak<BufferAllocator>,
        segment_id: SegmentId,
        segment_name: String,
        remote_address: u64,
        size: u64,
    ) -> Self {
        Self {
            pool,
            segment_id,
            segment_name,
            remote_address,
            size,
            status: BufStatus::Init,
        }
    }

    /// Segment the range belongs to
    #[must_use]
    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    /// Transport name of the segment
    #[must_use]
    pub fn segment_name(&self) -> &str {
        &self.segment_name
    }

    /// Absolute remote address of the range
    #[must_use]
    pub fn remote_address(&self) -> u64 {
        self.remote_address
    }

    /// Length of the range in bytes
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Current status. Reports `Unregistered` once the allocator has
    /// been torn down, regardless of the stored state.
    #[must_use]
    pub fn status(&self) -> BufStatus {
        if self.pool.strong_count() == 0 {
            BufStatus::Unregistered
        } else {
            self.status
        }
    }

    /// True when the backing segment is gone
    #[must_use]
    pub fn is_invalid(&self) -> bool {
        self.status() == BufStatus::Unregistered
    }

    /// Seal the handle after a successful transfer
    pub fn mark_complete(&mut self) {
        self.status = BufStatus::Complete;
    }

    /// Flag the handle after a failed transfer
    pub fn mark_failed(&mut self) {
        self.status = BufStatus::Failed;
    }

    /// Wire descriptor for this range
    #[must_use]
    pub fn descriptor(&self) -> BufferDescriptor {
        BufferDescriptor {
            segment_name: self.segment_name.clone(),
            remote_address: self.remote_address,
            size: self.size,
            status: self.status(),
        }
    }
}

impl Drop for AllocatedBuffer {
    fn drop(&mut self) {
        // If the allocator is gone the range died with the segment.
        if let Some(pool) = self.pool.upgrade() {
            pool.free(self.remote_address, self.size);
        }
    }
}

impl fmt::Debug for AllocatedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocatedBuffer")
            .field("segment_name", &self.segment_name)
            .field("remote_address", &format_args!("{:#x}", self.remote_address))
            .field("size", &self.size)
            .field("status", &self.status())
            .finish()
    }
}
