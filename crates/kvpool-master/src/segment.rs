//! Segment registry and the two-phase unmount protocol.
//!
//! The manager owns every mounted segment and its allocator. Access
//! goes through two scoped guards:
//!
//! - [`SegmentAccess`] (exclusive) for mount/unmount and queries over
//!   the segment table;
//! - [`AllocatorAccess`] (shared) for the read-only allocator view that
//!   `PutStart` allocates from.
//!
//! Unmount never holds the table lock across the O(objects) metadata
//! sweep: `prepare_unmount` pulls the allocator out of the table (which
//! flips outstanding handles to unregistered), the caller sweeps the
//! shards with no segment lock held, and `commit_unmount` drops the
//! segment record.

use crate::metrics::MasterMetrics;
use kvpool_allocator::BufferAllocator;
use kvpool_common::{ClientId, Error, Result, Segment, SegmentId};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Default)]
struct SegmentTables {
    /// Mounted segment records
    segments: HashMap<SegmentId, Segment>,
    /// Segments owned by each client
    by_client: HashMap<ClientId, HashSet<SegmentId>>,
    /// Active allocators; absent for segments between prepare and commit
    allocators: HashMap<SegmentId, Arc<BufferAllocator>>,
    /// Transport-name index over the same allocators
    allocators_by_name: HashMap<String, Arc<BufferAllocator>>,
}

/// Owner of all segments and their allocators
pub struct SegmentManager {
    tables: RwLock<SegmentTables>,
    metrics: Arc<MasterMetrics>,
}

impl SegmentManager {
    pub fn new(metrics: Arc<MasterMetrics>) -> Self {
        Self {
            tables: RwLock::new(SegmentTables::default()),
            metrics,
        }
    }

    /// Exclusive access for mount/unmount and table queries
    pub fn segment_access(&self) -> SegmentAccess<'_> {
        SegmentAccess {
            tables: self.tables.write(),
            metrics: &self.metrics,
        }
    }

    /// Shared access to the allocator view, used during PutStart
    pub fn allocator_access(&self) -> AllocatorAccess<'_> {
        AllocatorAccess {
            tables: self.tables.read(),
        }
    }
}

/// Scoped exclusive access to the segment tables
pub struct SegmentAccess<'a> {
    tables: RwLockWriteGuard<'a, SegmentTables>,
    metrics: &'a Arc<MasterMetrics>,
}

impl SegmentAccess<'_> {
    /// Install a segment and a fresh allocator over its range.
    ///
    /// Returns `SegmentAlreadyExists` when the id is already mounted;
    /// the caller treats that as idempotent success.
    pub fn mount_segment(&mut self, segment: &Segment) -> Result<()> {
        if self.tables.segments.contains_key(&segment.id) {
            return Err(Error::SegmentAlreadyExists(segment.id));
        }

        let allocator = BufferAllocator::new(segment);
        self.tables.allocators.insert(segment.id, allocator.clone());
        self.tables
            .allocators_by_name
            .insert(segment.name.clone(), allocator);
        self.tables
            .by_client
            .entry(segment.client_id)
            .or_default()
            .insert(segment.id);
        self.tables.segments.insert(segment.id, segment.clone());
        self.metrics.add_capacity(segment.size);

        info!(
            segment_id = %segment.id,
            segment_name = %segment.name,
            size = segment.size,
            client_id = %segment.client_id,
            "segment mounted"
        );
        Ok(())
    }

    /// Reinstall a client's full segment set after expiry.
    ///
    /// Segments that survived (still mounted) are skipped.
    pub fn remount_segments(&mut self, segments: &[Segment], client_id: ClientId) -> Result<()> {
        for segment in segments {
            match self.mount_segment(segment) {
                Ok(()) => {}
                Err(Error::SegmentAlreadyExists(id)) => {
                    debug!(segment_id = %id, client_id = %client_id, "segment survived expiry");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Phase one of unmount: verify ownership and pull the allocator.
    ///
    /// After this returns, no new allocation can land in the segment
    /// and every outstanding handle observes `Unregistered`. Returns
    /// the capacity to subtract at commit time.
    pub fn prepare_unmount(&mut self, segment_id: SegmentId, client_id: ClientId) -> Result<u64> {
        let segment = self
            .tables
            .segments
            .get(&segment_id)
            .ok_or_else(|| Error::SegmentNotFound(segment_id.to_string()))?;
        if segment.client_id != client_id {
            return Err(Error::invalid_params(format!(
                "segment {} is owned by client {}, not {}",
                segment_id, segment.client_id, client_id
            )));
        }
        let size = segment.size;

        if let Some(allocator) = self.tables.allocators.remove(&segment_id) {
            // The name index may already point at a newer segment that
            // reused the name; only drop it when it is still ours.
            let name_matches = self
                .tables
                .allocators_by_name
                .get(allocator.segment_name())
                .is_some_and(|other| Arc::ptr_eq(other, &allocator));
            if name_matches {
                self.tables.allocators_by_name.remove(allocator.segment_name());
            }
            // Dropping the Arc here is what invalidates the handles.
            debug_assert_eq!(Arc::strong_count(&allocator), 1);
        }
        Ok(size)
    }

    /// Phase three of unmount: drop the segment record.
    ///
    /// A missing segment means a concurrent commit already ran; that is
    /// logged and treated as success to keep unmount idempotent.
    pub fn commit_unmount(&mut self, segment_id: SegmentId, client_id: ClientId, dec_capacity: u64) {
        match self.tables.segments.remove(&segment_id) {
            Some(segment) => {
                if let Some(owned) = self.tables.by_client.get_mut(&client_id) {
                    owned.remove(&segment_id);
                    if owned.is_empty() {
                        self.tables.by_client.remove(&client_id);
                    }
                }
                self.metrics.sub_capacity(dec_capacity);
                info!(
                    segment_id = %segment_id,
                    segment_name = %segment.name,
                    client_id = %client_id,
                    "segment unmounted"
                );
            }
            None => {
                warn!(segment_id = %segment_id, "commit found no segment, already unmounted");
            }
        }
    }

    /// Names of all mounted segments
    #[must_use]
    pub fn all_segments(&self) -> Vec<String> {
        self.tables.segments.values().map(|s| s.name.clone()).collect()
    }

    /// (used, capacity) for the named segment
    pub fn query_segment(&self, name: &str) -> Result<(u64, u64)> {
        let allocator = self
            .tables
            .allocators_by_name
            .get(name)
            .ok_or_else(|| Error::SegmentNotFound(name.to_string()))?;
        Ok((allocator.used_bytes(), allocator.capacity()))
    }

    /// Segments owned by `client_id`
    #[must_use]
    pub fn client_segments(&self, client_id: ClientId) -> Vec<Segment> {
        self.tables
            .by_client
            .get(&client_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.tables.segments.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Scoped shared access to the allocator table
pub struct AllocatorAccess<'a> {
    tables: RwLockReadGuard<'a, SegmentTables>,
}

impl AllocatorAccess<'_> {
    /// Active allocators by segment id
    #[must_use]
    pub fn allocators(&self) -> &HashMap<SegmentId, Arc<BufferAllocator>> {
        &self.tables.allocators
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SegmentManager {
        SegmentManager::new(Arc::new(MasterMetrics::new()))
    }

    fn segment(name: &str, size: u64, client_id: ClientId) -> Segment {
        Segment {
            id: SegmentId::new(),
            name: name.to_string(),
            base: 0x4000_0000,
            size,
            client_id,
        }
    }

    #[test]
    fn test_mount_and_query() {
        let manager = manager();
        let client = ClientId::new();
        let seg = segment("s1", 1 << 20, client);

        let mut access = manager.segment_access();
        access.mount_segment(&seg).unwrap();
        assert_eq!(access.all_segments(), vec!["s1".to_string()]);
        assert_eq!(access.query_segment("s1").unwrap(), (0, 1 << 20));
        assert_eq!(access.client_segments(client).len(), 1);
    }

    #[test]
    fn test_mount_same_id_twice() {
        let manager = manager();
        let seg = segment("s1", 1 << 20, ClientId::new());

        let mut access = manager.segment_access();
        access.mount_segment(&seg).unwrap();
        assert!(matches!(
            access.mount_segment(&seg),
            Err(Error::SegmentAlreadyExists(_))
        ));
        assert_eq!(access.all_segments().len(), 1);
    }

    #[test]
    fn test_capacity_metric_follows_lifecycle() {
        let metrics = Arc::new(MasterMetrics::new());
        let manager = SegmentManager::new(metrics.clone());
        let client = ClientId::new();
        let seg = segment("s1", 4096, client);

        let mut access = manager.segment_access();
        access.mount_segment(&seg).unwrap();
        assert_eq!(metrics.total_capacity(), 4096);

        let dec = access.prepare_unmount(seg.id, client).unwrap();
        assert_eq!(dec, 4096);
        // Capacity drops only at commit
        assert_eq!(metrics.total_capacity(), 4096);

        access.commit_unmount(seg.id, client, dec);
        assert_eq!(metrics.total_capacity(), 0);
        assert!(access.all_segments().is_empty());
    }

    #[test]
    fn test_prepare_invalidates_handles() {
        let manager = manager();
        let client = ClientId::new();
        let seg = segment("s1", 1 << 20, client);

        manager.segment_access().mount_segment(&seg).unwrap();
        let buf = {
            let access = manager.allocator_access();
            access.allocators()[&seg.id].allocate(1024).unwrap()
        };
        assert!(!buf.is_invalid());

        manager
            .segment_access()
            .prepare_unmount(seg.id, client)
            .unwrap();
        assert!(buf.is_invalid());

        // A new PutStart cannot see the allocator anymore
        assert!(manager.allocator_access().allocators().get(&seg.id).is_none());
    }

    #[test]
    fn test_prepare_rejects_wrong_owner() {
        let manager = manager();
        let owner = ClientId::new();
        let seg = segment("s1", 4096, owner);

        let mut access = manager.segment_access();
        access.mount_segment(&seg).unwrap();
        assert!(access.prepare_unmount(seg.id, ClientId::new()).is_err());
        // Still mounted and allocatable
        assert!(access.query_segment("s1").is_ok());
    }

    #[test]
    fn test_remount_skips_surviving_segments() {
        let manager = manager();
        let client = ClientId::new();
        let a = segment("a", 4096, client);
        let b = segment("b", 4096, client);

        let mut access = manager.segment_access();
        access.mount_segment(&a).unwrap();
        access
            .remount_segments(&[a.clone(), b.clone()], client)
            .unwrap();
        assert_eq!(access.client_segments(client).len(), 2);
    }
}
