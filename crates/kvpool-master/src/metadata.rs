//! Sharded object metadata store.
//!
//! Keys hash into a fixed array of independently locked shards. All
//! operations on one object happen under its shard mutex, acquired
//! through a scoped [`MetadataAccessor`]. Accessors are never nested:
//! batch operations take one accessor at a time, and the full-store
//! walks (sweep, eviction, RemoveAll) lock exactly one shard per step.

use kvpool_allocator::AllocatedBuffer;
use kvpool_common::{ReplicaDescriptor, ReplicaStatus};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use xxhash_rust::xxh3::xxh3_64;

/// Number of metadata shards. Must be a power of two.
pub const NUM_SHARDS: usize = 1024;

/// One placement of an object: an ordered run of handles covering its
/// bytes.
pub struct Replica {
    handles: Vec<AllocatedBuffer>,
    status: ReplicaStatus,
}

impl Replica {
    /// New replica in the Processing state
    #[must_use]
    pub fn new(handles: Vec<AllocatedBuffer>) -> Self {
        Self {
            handles,
            status: ReplicaStatus::Processing,
        }
    }

    #[must_use]
    pub fn status(&self) -> ReplicaStatus {
        self.status
    }

    #[must_use]
    pub fn handles(&self) -> &[AllocatedBuffer] {
        &self.handles
    }

    /// Seal the replica and every handle in it
    pub fn mark_complete(&mut self) {
        self.status = ReplicaStatus::Complete;
        for handle in &mut self.handles {
            handle.mark_complete();
        }
    }

    /// True when any handle lost its segment
    #[must_use]
    pub fn has_invalid_handle(&self) -> bool {
        self.handles.iter().any(AllocatedBuffer::is_invalid)
    }

    #[must_use]
    pub fn descriptor(&self) -> ReplicaDescriptor {
        ReplicaDescriptor {
            status: self.status,
            handles: self.handles.iter().map(AllocatedBuffer::descriptor).collect(),
        }
    }
}

/// Metadata for one stored object
pub struct ObjectMetadata {
    size: u64,
    replicas: Vec<Replica>,
    /// Lease deadline on the monotonic clock; `<= now` means expired
    lease_expiry: Instant,
}

impl ObjectMetadata {
    /// New metadata with an already expired lease
    #[must_use]
    pub fn new(size: u64, replicas: Vec<Replica>) -> Self {
        Self {
            size,
            replicas,
            lease_expiry: Instant::now(),
        }
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn replicas(&self) -> &[Replica] {
        &self.replicas
    }

    pub fn replicas_mut(&mut self) -> &mut Vec<Replica> {
        &mut self.replicas
    }

    #[must_use]
    pub fn lease_expiry(&self) -> Instant {
        self.lease_expiry
    }

    /// Extend the lease to at least `now + ttl`. Leases only ever grow.
    pub fn grant_lease(&mut self, ttl: Duration) {
        self.lease_expiry = self.lease_expiry.max(Instant::now() + ttl);
    }

    #[must_use]
    pub fn is_lease_expired(&self, now: Instant) -> bool {
        self.lease_expiry <= now
    }

    /// First replica whose status differs from `expected`, if any
    #[must_use]
    pub fn status_diff(&self, expected: ReplicaStatus) -> Option<ReplicaStatus> {
        self.replicas
            .iter()
            .map(Replica::status)
            .find(|&s| s != expected)
    }

    /// Drop replicas that contain invalid handles.
    ///
    /// Returns true when no replica remains, i.e. the entry is stale
    /// and should be erased or overwritten.
    pub fn cleanup_stale_replicas(&mut self) -> bool {
        self.replicas.retain(|r| !r.has_invalid_handle());
        self.replicas.is_empty()
    }

    #[must_use]
    pub fn descriptors(&self) -> Vec<ReplicaDescriptor> {
        self.replicas.iter().map(Replica::descriptor).collect()
    }

    /// Bytes this object pins across all replicas
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.size * self.replicas.len() as u64
    }
}

type ShardMap = HashMap<String, ObjectMetadata>;

/// Fixed-fan-out sharded map from object key to metadata
pub struct MetadataStore {
    shards: Vec<Mutex<ShardMap>>,
}

impl MetadataStore {
    #[must_use]
    pub fn new() -> Self {
        let shards = (0..NUM_SHARDS).map(|_| Mutex::new(ShardMap::new())).collect();
        Self { shards }
    }

    fn shard_index(key: &str) -> usize {
        (xxh3_64(key.as_bytes()) as usize) & (NUM_SHARDS - 1)
    }

    /// Lock the shard holding `key` and return a scoped accessor
    pub fn accessor<'a>(&'a self, key: &str) -> MetadataAccessor<'a> {
        let guard = self.shards[Self::shard_index(key)].lock();
        MetadataAccessor {
            guard,
            key: key.to_string(),
        }
    }

    #[must_use]
    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    /// Lock shard `index` directly (full-store walks)
    pub fn lock_shard(&self, index: usize) -> MutexGuard<'_, ShardMap> {
        self.shards[index].lock()
    }

    /// Total number of stored objects
    #[must_use]
    pub fn key_count(&self) -> u64 {
        self.shards.iter().map(|s| s.lock().len() as u64).sum()
    }

    /// All stored keys, shard by shard
    #[must_use]
    pub fn all_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        for shard in &self.shards {
            keys.extend(shard.lock().keys().cloned());
        }
        keys
    }

    /// Drop every replica that references a dead segment, erasing
    /// objects left with no replicas. Called between unmount prepare
    /// and commit, with no segment lock held.
    pub fn clear_invalid_handles(&self) {
        for shard in &self.shards {
            shard.lock().retain(|_, metadata| !metadata.cleanup_stale_replicas());
        }
    }
}

impl Default for MetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped handle over one key's shard.
///
/// Holds the shard mutex for its whole lifetime; released on drop on
/// every path. Never hold two accessors at once.
pub struct MetadataAccessor<'a> {
    guard: MutexGuard<'a, ShardMap>,
    key: String,
}

impl MetadataAccessor<'_> {
    #[must_use]
    pub fn exists(&self) -> bool {
        self.guard.contains_key(&self.key)
    }

    #[must_use]
    pub fn get(&self) -> Option<&ObjectMetadata> {
        self.guard.get(&self.key)
    }

    pub fn get_mut(&mut self) -> Option<&mut ObjectMetadata> {
        self.guard.get_mut(&self.key)
    }

    /// Insert or overwrite the entry
    pub fn insert(&mut self, metadata: ObjectMetadata) {
        self.guard.insert(self.key.clone(), metadata);
    }

    /// Erase the entry, freeing its handles (and so the allocator
    /// ranges) when the returned metadata drops
    pub fn erase(&mut self) -> Option<ObjectMetadata> {
        self.guard.remove(&self.key)
    }
}
