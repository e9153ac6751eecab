//! The master service: every control-plane operation, the batch forms,
//! and the background thread lifecycle.
//!
//! [`MasterService`] is the process-wide entry point. Construction
//! validates the config and starts the GC thread (always) and the
//! client monitor thread (HA mode); drop stops and joins both. All
//! operations return `Result<T>` and never panic across the boundary.

use crate::gc::{GcTask, GC_DELAY_MS, GC_QUEUE_CAPACITY};
use crate::metadata::{MetadataStore, ObjectMetadata, Replica};
use crate::metrics::{MasterMetrics, MasterOp};
use crate::monitor::PING_QUEUE_CAPACITY;
use crate::segment::SegmentManager;
use crossbeam_queue::ArrayQueue;
use kvpool_common::{
    ClientId, ClientStatus, Error, MasterConfig, ReplicaDescriptor, ReplicaStatus,
    ReplicateConfig, Result, Segment, SegmentId, ViewVersion, MAX_SLICE_SIZE,
};
use kvpool_placement::{AllocationStrategy, RandomStrategy};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Shared state of the master, owned jointly by the service handle and
/// the background threads.
pub(crate) struct MasterInner {
    pub(crate) config: MasterConfig,
    pub(crate) metrics: Arc<MasterMetrics>,
    pub(crate) segments: SegmentManager,
    pub(crate) store: MetadataStore,
    pub(crate) strategy: Box<dyn AllocationStrategy>,
    pub(crate) gc_queue: ArrayQueue<GcTask>,
    pub(crate) ping_queue: ArrayQueue<ClientId>,
    /// Clients within their ping TTL (HA); guarded by the client lock,
    /// which is always taken before the segment lock
    pub(crate) ok_clients: RwLock<HashSet<ClientId>>,
    /// Raised by PutStart on allocation failure, cleared by eviction
    pub(crate) need_eviction: AtomicBool,
    pub(crate) running: AtomicBool,
}

/// The kvpool metadata master.
pub struct MasterService {
    inner: Arc<MasterInner>,
    gc_thread: Option<JoinHandle<()>>,
    monitor_thread: Option<JoinHandle<()>>,
}

impl MasterService {
    /// Create a master with its own metrics collector
    pub fn new(config: MasterConfig) -> Result<Self> {
        Self::with_metrics(config, Arc::new(MasterMetrics::new()))
    }

    /// Create a master publishing into the given metrics collector
    pub fn with_metrics(config: MasterConfig, metrics: Arc<MasterMetrics>) -> Result<Self> {
        config.validate()?;
        let enable_ha = config.enable_ha;

        let inner = Arc::new(MasterInner {
            segments: SegmentManager::new(metrics.clone()),
            store: MetadataStore::new(),
            strategy: Box::new(RandomStrategy::new()),
            gc_queue: ArrayQueue::new(GC_QUEUE_CAPACITY),
            ping_queue: ArrayQueue::new(PING_QUEUE_CAPACITY),
            ok_clients: RwLock::new(HashSet::new()),
            need_eviction: AtomicBool::new(false),
            running: AtomicBool::new(true),
            config,
            metrics,
        });

        let gc_thread = {
            let inner = inner.clone();
            std::thread::Builder::new()
                .name("kvpool-gc".to_string())
                .spawn(move || inner.gc_loop())
                .map_err(|e| Error::internal(format!("failed to spawn gc thread: {e}")))?
        };

        let monitor_thread = if enable_ha {
            let inner = inner.clone();
            let handle = std::thread::Builder::new()
                .name("kvpool-client-monitor".to_string())
                .spawn(move || inner.monitor_loop())
                .map_err(|e| Error::internal(format!("failed to spawn monitor thread: {e}")))?;
            Some(handle)
        } else {
            None
        };

        Ok(Self {
            inner,
            gc_thread: Some(gc_thread),
            monitor_thread,
        })
    }

    /// Metrics collector this master publishes into
    #[must_use]
    pub fn metrics(&self) -> &Arc<MasterMetrics> {
        &self.inner.metrics
    }

    // ---- object operations ----

    /// Check whether `key` is stored and readable. Grants a read lease
    /// on success.
    pub fn exist_key(&self, key: &str) -> Result<bool> {
        let result = self.inner.exist_key(key);
        self.inner.metrics.record_op(MasterOp::ExistKey, result.is_ok());
        result
    }

    pub fn batch_exist_key(&self, keys: &[String]) -> Vec<Result<bool>> {
        keys.iter().map(|key| self.exist_key(key)).collect()
    }

    /// Fetch the replica descriptors for `key`. In GC mode this
    /// schedules the object's removal; otherwise it grants a lease.
    pub fn get_replica_list(&self, key: &str) -> Result<Vec<ReplicaDescriptor>> {
        let result = self.inner.get_replica_list(key);
        self.inner
            .metrics
            .record_op(MasterOp::GetReplicaList, result.is_ok());
        result
    }

    pub fn batch_get_replica_list(&self, keys: &[String]) -> Vec<Result<Vec<ReplicaDescriptor>>> {
        keys.iter().map(|key| self.get_replica_list(key)).collect()
    }

    /// Allocate replica placements for a new object
    pub fn put_start(
        &self,
        key: &str,
        value_length: u64,
        slice_lengths: &[u64],
        config: &ReplicateConfig,
    ) -> Result<Vec<ReplicaDescriptor>> {
        let result = self.inner.put_start(key, value_length, slice_lengths, config);
        self.inner.metrics.record_op(MasterOp::PutStart, result.is_ok());
        result
    }

    /// Per-element arrays variant of PutStart. A mismatched slot fails
    /// alone; the batch never aborts.
    pub fn batch_put_start(
        &self,
        keys: &[String],
        value_lengths: &[u64],
        slice_lengths: &[Vec<u64>],
        config: &ReplicateConfig,
    ) -> Vec<Result<Vec<ReplicaDescriptor>>> {
        keys.iter()
            .enumerate()
            .map(|(i, key)| {
                if i >= value_lengths.len() || i >= slice_lengths.len() {
                    self.inner.metrics.record_op(MasterOp::PutStart, false);
                    return Err(Error::invalid_params(format!(
                        "batch arrays disagree at element {i}"
                    )));
                }
                self.put_start(key, value_lengths[i], &slice_lengths[i], config)
            })
            .collect()
    }

    /// Seal every replica of `key` after the client finished writing
    pub fn put_end(&self, key: &str) -> Result<()> {
        let result = self.inner.put_end(key);
        self.inner.metrics.record_op(MasterOp::PutEnd, result.is_ok());
        result
    }

    pub fn batch_put_end(&self, keys: &[String]) -> Vec<Result<()>> {
        keys.iter().map(|key| self.put_end(key)).collect()
    }

    /// Abandon an in-flight put, freeing its allocations
    pub fn put_revoke(&self, key: &str) -> Result<()> {
        let result = self.inner.put_revoke(key);
        self.inner.metrics.record_op(MasterOp::PutRevoke, result.is_ok());
        result
    }

    pub fn batch_put_revoke(&self, keys: &[String]) -> Vec<Result<()>> {
        keys.iter().map(|key| self.put_revoke(key)).collect()
    }

    /// Remove `key` if it is complete and lease expired
    pub fn remove(&self, key: &str) -> Result<()> {
        let result = self.inner.remove(key);
        self.inner.metrics.record_op(MasterOp::Remove, result.is_ok());
        result
    }

    /// Remove every lease-expired object; returns the count removed
    pub fn remove_all(&self) -> u64 {
        let removed = self.inner.remove_all();
        self.inner.metrics.record_op(MasterOp::RemoveAll, true);
        removed
    }

    /// All stored keys
    #[must_use]
    pub fn get_all_keys(&self) -> Vec<String> {
        self.inner.store.all_keys()
    }

    /// Total number of stored objects
    #[must_use]
    pub fn get_key_count(&self) -> u64 {
        self.inner.store.key_count()
    }

    // ---- segment operations ----

    /// Register a client's memory range. Idempotent on segment id.
    pub fn mount_segment(&self, segment: &Segment, client_id: ClientId) -> Result<()> {
        let result = self.inner.mount_segment(segment, client_id);
        self.inner
            .metrics
            .record_op(MasterOp::MountSegment, result.is_ok());
        result
    }

    /// Re-announce a client's full segment set after expiry (HA).
    /// Idempotent on clients that are still alive.
    pub fn remount_segments(&self, segments: &[Segment], client_id: ClientId) -> Result<()> {
        let result = self.inner.remount_segments(segments, client_id);
        self.inner
            .metrics
            .record_op(MasterOp::ReMountSegment, result.is_ok());
        result
    }

    /// Withdraw a segment and drop every replica placed in it.
    /// Idempotent.
    pub fn unmount_segment(&self, segment_id: SegmentId, client_id: ClientId) -> Result<()> {
        let result = self.inner.unmount_segment(segment_id, client_id);
        self.inner
            .metrics
            .record_op(MasterOp::UnmountSegment, result.is_ok());
        result
    }

    /// Names of all mounted segments
    #[must_use]
    pub fn get_all_segments(&self) -> Vec<String> {
        self.inner.segments.segment_access().all_segments()
    }

    /// (used, capacity) of the named segment
    pub fn query_segment(&self, name: &str) -> Result<(u64, u64)> {
        self.inner.segments.segment_access().query_segment(name)
    }

    // ---- HA operations ----

    /// Liveness probe. Reports whether the client must re-mount.
    pub fn ping(&self, client_id: ClientId) -> Result<(ViewVersion, ClientStatus)> {
        let result = self.inner.ping(client_id);
        self.inner.metrics.record_op(MasterOp::Ping, result.is_ok());
        result
    }

    /// Cluster id for client-side transfer-path discovery
    pub fn get_fsdir(&self) -> Result<String> {
        if self.inner.config.cluster_id.is_empty() {
            return Err(Error::invalid_params("cluster id is not configured"));
        }
        Ok(self.inner.config.cluster_id.clone())
    }
}

impl Drop for MasterService {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::Release);
        if let Some(handle) = self.gc_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.monitor_thread.take() {
            let _ = handle.join();
        }
    }
}

impl MasterInner {
    fn default_lease_ttl(&self) -> Duration {
        Duration::from_millis(self.config.default_kv_lease_ttl_ms)
    }

    fn exist_key(&self, key: &str) -> Result<bool> {
        let mut accessor = self.store.accessor(key);
        let Some(metadata) = accessor.get_mut() else {
            debug!(key = %key, "object not found");
            return Ok(false);
        };
        if let Some(status) = metadata.status_diff(ReplicaStatus::Complete) {
            warn!(key = %key, status = %status, "replica not ready");
            return Err(Error::ReplicaNotReady { key: key.to_string() });
        }

        // The client is likely to read next; protect the object.
        metadata.grant_lease(self.default_lease_ttl());
        Ok(true)
    }

    fn get_replica_list(&self, key: &str) -> Result<Vec<ReplicaDescriptor>> {
        let mut accessor = self.store.accessor(key);
        let Some(metadata) = accessor.get_mut() else {
            debug!(key = %key, "object not found");
            return Err(Error::ObjectNotFound { key: key.to_string() });
        };
        if let Some(status) = metadata.status_diff(ReplicaStatus::Complete) {
            warn!(key = %key, status = %status, "replica not ready");
            return Err(Error::ReplicaNotReady { key: key.to_string() });
        }

        let descriptors = metadata.descriptors();

        if self.config.enable_gc {
            // Read-then-delete cache: schedule removal instead of
            // granting a lease. Queue overflow skips the scheduling.
            let _ = self.mark_for_gc(key, GC_DELAY_MS);
        } else {
            metadata.grant_lease(self.default_lease_ttl());
        }

        Ok(descriptors)
    }

    fn put_start(
        &self,
        key: &str,
        value_length: u64,
        slice_lengths: &[u64],
        config: &ReplicateConfig,
    ) -> Result<Vec<ReplicaDescriptor>> {
        if config.replica_num == 0 || value_length == 0 || key.is_empty() {
            warn!(
                key = %key,
                replica_num = config.replica_num,
                value_length,
                "invalid put parameters"
            );
            return Err(Error::invalid_params(format!(
                "replica_num={}, value_length={}, key_len={}",
                config.replica_num,
                value_length,
                key.len()
            )));
        }

        let mut total_length = 0u64;
        for (i, &len) in slice_lengths.iter().enumerate() {
            if len == 0 || len > MAX_SLICE_SIZE {
                warn!(key = %key, slice_index = i, slice_size = len, "invalid slice size");
                return Err(Error::invalid_params(format!(
                    "slice {i} has size {len}, limit {MAX_SLICE_SIZE}"
                )));
            }
            total_length += len;
        }
        if total_length != value_length {
            warn!(
                key = %key,
                total_length,
                value_length,
                "slice lengths disagree with value length"
            );
            return Err(Error::invalid_params(format!(
                "slices sum to {total_length}, value length is {value_length}"
            )));
        }

        debug!(
            key = %key,
            value_length,
            slice_count = slice_lengths.len(),
            config = %config,
            "put start"
        );

        // Allocator view first, then the shard: the segment lock always
        // comes before any shard mutex.
        let allocator_access = self.segments.allocator_access();
        let mut accessor = self.store.accessor(key);

        if let Some(existing) = accessor.get_mut() {
            if !existing.cleanup_stale_replicas() {
                info!(key = %key, "object already exists");
                return Err(Error::ObjectAlreadyExists { key: key.to_string() });
            }
            // Every replica referenced a dead segment; drop the stale
            // entry now so a failed allocation below leaves nothing.
            accessor.erase();
        }

        let allocators = allocator_access.allocators();
        let mut replicas = Vec::with_capacity(config.replica_num);
        let mut used_segments: HashSet<SegmentId> = HashSet::new();
        for replica_index in 0..config.replica_num {
            let mut handles = Vec::with_capacity(slice_lengths.len());
            for (slice_index, &len) in slice_lengths.iter().enumerate() {
                match self.strategy.allocate(allocators, len, config, &used_segments) {
                    Some(handle) => handles.push(handle),
                    None => {
                        warn!(
                            key = %key,
                            replica_index,
                            slice_index,
                            "allocation failed, requesting eviction"
                        );
                        // Dropping the partial handles frees their ranges.
                        self.need_eviction.store(true, Ordering::Relaxed);
                        return Err(Error::NoAvailableHandle);
                    }
                }
            }
            for handle in &handles {
                used_segments.insert(handle.segment_id());
            }
            replicas.push(Replica::new(handles));
        }

        // No lease yet: the object cannot be evicted while any replica
        // is still processing.
        let metadata = ObjectMetadata::new(value_length, replicas);
        let descriptors = metadata.descriptors();
        accessor.insert(metadata);
        Ok(descriptors)
    }

    fn put_end(&self, key: &str) -> Result<()> {
        let mut accessor = self.store.accessor(key);
        let Some(metadata) = accessor.get_mut() else {
            warn!(key = %key, "put end for unknown object");
            return Err(Error::ObjectNotFound { key: key.to_string() });
        };

        for replica in metadata.replicas_mut() {
            replica.mark_complete();
        }
        // Expired lease: the object is unprotected until its first read.
        metadata.grant_lease(Duration::ZERO);
        Ok(())
    }

    fn put_revoke(&self, key: &str) -> Result<()> {
        let mut accessor = self.store.accessor(key);
        let Some(metadata) = accessor.get_mut() else {
            info!(key = %key, "put revoke for unknown object");
            return Err(Error::ObjectNotFound { key: key.to_string() });
        };

        if let Some(status) = metadata.status_diff(ReplicaStatus::Processing) {
            warn!(key = %key, status = %status, "revoke of a sealed object");
            return Err(Error::InvalidWrite { key: key.to_string() });
        }

        accessor.erase();
        Ok(())
    }

    pub(crate) fn remove(&self, key: &str) -> Result<()> {
        let mut accessor = self.store.accessor(key);
        let Some(metadata) = accessor.get() else {
            debug!(key = %key, "object not found");
            return Err(Error::ObjectNotFound { key: key.to_string() });
        };

        if !metadata.is_lease_expired(Instant::now()) {
            debug!(key = %key, "object has a live lease");
            return Err(Error::ObjectHasLease { key: key.to_string() });
        }
        if let Some(status) = metadata.status_diff(ReplicaStatus::Complete) {
            warn!(key = %key, status = %status, "remove of an incomplete object");
            return Err(Error::ReplicaNotReady { key: key.to_string() });
        }

        accessor.erase();
        Ok(())
    }

    fn remove_all(&self) -> u64 {
        let now = Instant::now();
        let mut removed = 0u64;
        let mut freed_bytes = 0u64;

        for index in 0..self.store.num_shards() {
            let mut shard = self.store.lock_shard(index);
            shard.retain(|_, metadata| {
                if metadata.is_lease_expired(now) {
                    removed += 1;
                    freed_bytes += metadata.total_bytes();
                    false
                } else {
                    true
                }
            });
        }

        info!(removed, freed_bytes, "removed all lease-expired objects");
        removed
    }

    fn mark_for_gc(&self, key: &str, delay_ms: u64) -> Result<()> {
        let task = GcTask {
            key: key.to_string(),
            ready_at: Instant::now() + Duration::from_millis(delay_ms),
        };
        if self.gc_queue.push(task).is_err() {
            warn!(key = %key, "gc queue full");
            return Err(Error::internal("gc queue full"));
        }
        Ok(())
    }

    fn mount_segment(&self, segment: &Segment, client_id: ClientId) -> Result<()> {
        if segment.size == 0 || segment.name.is_empty() {
            return Err(Error::invalid_params(format!(
                "segment name={:?}, size={}",
                segment.name, segment.size
            )));
        }
        let segment = Segment {
            client_id,
            ..segment.clone()
        };

        let mut access = self.segments.segment_access();

        if self.config.enable_ha {
            // The ping must be enqueued after taking the segment lock
            // and before the mount lands: earlier, and the monitor can
            // expire the client while this mount is still in flight;
            // later, and a full queue would leave a mounted client
            // unmonitored forever.
            if self.ping_queue.push(client_id).is_err() {
                warn!(segment_name = %segment.name, "client ping queue full");
                return Err(Error::internal("client ping queue full"));
            }
        }

        match access.mount_segment(&segment) {
            // Idempotent re-mount of the same segment id
            Err(Error::SegmentAlreadyExists(_)) => Ok(()),
            other => other,
        }
    }

    fn remount_segments(&self, segments: &[Segment], client_id: ClientId) -> Result<()> {
        if !self.config.enable_ha {
            warn!("remount is only available in ha mode");
            return Err(Error::UnavailableInCurrentMode("ReMountSegment"));
        }

        let mut ok_clients = self.ok_clients.write();
        if ok_clients.contains(&client_id) {
            info!(client_id = %client_id, "client already remounted");
            return Ok(());
        }

        let mut access = self.segments.segment_access();

        // Same ordering constraint as in mount_segment.
        if self.ping_queue.push(client_id).is_err() {
            warn!(client_id = %client_id, "client ping queue full");
            return Err(Error::internal("client ping queue full"));
        }

        let owned: Vec<Segment> = segments
            .iter()
            .map(|s| Segment {
                client_id,
                ..s.clone()
            })
            .collect();
        access.remount_segments(&owned, client_id)?;

        ok_clients.insert(client_id);
        self.metrics.inc_active_clients();
        Ok(())
    }

    fn unmount_segment(&self, segment_id: SegmentId, client_id: ClientId) -> Result<()> {
        // Phase 1: pull the allocator so nothing new lands in the
        // segment and existing handles turn invalid.
        let dec_capacity = {
            let mut access = self.segments.segment_access();
            match access.prepare_unmount(segment_id, client_id) {
                Ok(dec_capacity) => dec_capacity,
                // Idempotent: already unmounted
                Err(Error::SegmentNotFound(_)) => return Ok(()),
                Err(e) => return Err(e),
            }
        };

        // Phase 2: sweep the shards with no segment lock held.
        self.store.clear_invalid_handles();

        // Phase 3: drop the segment record and release its capacity.
        self.segments
            .segment_access()
            .commit_unmount(segment_id, client_id, dec_capacity);
        Ok(())
    }

    fn ping(&self, client_id: ClientId) -> Result<(ViewVersion, ClientStatus)> {
        if !self.config.enable_ha {
            warn!("ping is only available in ha mode");
            return Err(Error::UnavailableInCurrentMode("Ping"));
        }

        let ok_clients = self.ok_clients.read();
        let status = if ok_clients.contains(&client_id) {
            ClientStatus::Ok
        } else {
            ClientStatus::NeedRemount
        };

        if self.ping_queue.push(client_id).is_err() {
            warn!(client_id = %client_id, "client ping queue full");
            return Err(Error::internal("client ping queue full"));
        }
        Ok((self.config.view_version, status))
    }

    /// Publish usage gauges from the allocator table (one GC pass)
    pub(crate) fn refresh_usage(&self) {
        let mut used = 0u64;
        let mut per_segment: HashMap<String, (u64, u64)> = HashMap::new();
        {
            let access = self.segments.allocator_access();
            for allocator in access.allocators().values() {
                let segment_used = allocator.used_bytes();
                used += segment_used;
                per_segment.insert(
                    allocator.segment_name().to_string(),
                    (segment_used, allocator.capacity()),
                );
            }
        }
        self.metrics.set_usage(used, per_segment);
        self.metrics.set_key_count(self.store.key_count());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MasterConfig {
        MasterConfig {
            default_kv_lease_ttl_ms: 150,
            ..MasterConfig::default()
        }
    }

    fn service(config: MasterConfig) -> MasterService {
        MasterService::new(config).unwrap()
    }

    fn mount(master: &MasterService, name: &str, size: u64) -> (Segment, ClientId) {
        let client_id = ClientId::new();
        let segment = Segment {
            id: SegmentId::new(),
            name: name.to_string(),
            base: 0x8000_0000,
            size,
            client_id,
        };
        master.mount_segment(&segment, client_id).unwrap();
        (segment, client_id)
    }

    fn put_complete(master: &MasterService, key: &str, slices: &[u64]) {
        let value_length: u64 = slices.iter().sum();
        master
            .put_start(key, value_length, slices, &ReplicateConfig::default())
            .unwrap();
        master.put_end(key).unwrap();
    }

    #[test]
    fn test_put_get_roundtrip_with_lease() {
        let master = service(config());
        mount(&master, "s1", 1 << 30);

        let descriptors = master
            .put_start("k", 1024, &[512, 512], &ReplicateConfig::default())
            .unwrap();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].status, ReplicaStatus::Processing);
        assert_eq!(descriptors[0].handles.len(), 2);
        assert_eq!(descriptors[0].handles[0].size, 512);
        assert_eq!(descriptors[0].handles[1].size, 512);
        let written: u64 = descriptors[0].handles.iter().map(|b| b.size).sum();
        assert_eq!(written, 1024);

        master.put_end("k").unwrap();

        let read = master.get_replica_list("k").unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].status, ReplicaStatus::Complete);
        assert_eq!(
            read[0].handles[0].remote_address,
            descriptors[0].handles[0].remote_address
        );

        // The read granted a lease; removal must wait it out
        assert!(matches!(
            master.remove("k"),
            Err(Error::ObjectHasLease { .. })
        ));
        std::thread::sleep(Duration::from_millis(250));
        master.remove("k").unwrap();
        assert_eq!(master.get_all_keys().len(), 0);
    }

    #[test]
    fn test_object_not_ready_until_put_end() {
        let master = service(config());
        mount(&master, "s1", 1 << 20);

        master
            .put_start("k", 64, &[64], &ReplicateConfig::default())
            .unwrap();
        assert!(matches!(
            master.exist_key("k"),
            Err(Error::ReplicaNotReady { .. })
        ));
        assert!(matches!(
            master.get_replica_list("k"),
            Err(Error::ReplicaNotReady { .. })
        ));

        master.put_end("k").unwrap();
        assert_eq!(master.exist_key("k").unwrap(), true);
    }

    #[test]
    fn test_exist_key_missing() {
        let master = service(config());
        assert_eq!(master.exist_key("nope").unwrap(), false);
        assert!(matches!(
            master.get_replica_list("nope"),
            Err(Error::ObjectNotFound { .. })
        ));
    }

    #[test]
    fn test_put_start_validation() {
        let master = service(config());
        mount(&master, "s1", 1 << 20);
        let replicate = ReplicateConfig::default();

        assert!(matches!(
            master.put_start("", 64, &[64], &replicate),
            Err(Error::InvalidParams(_))
        ));
        assert!(matches!(
            master.put_start("k", 0, &[], &replicate),
            Err(Error::InvalidParams(_))
        ));
        assert!(matches!(
            master.put_start("k", 128, &[64], &replicate),
            Err(Error::InvalidParams(_))
        ));
        assert!(matches!(
            master.put_start(
                "k",
                MAX_SLICE_SIZE + 1,
                &[MAX_SLICE_SIZE + 1],
                &replicate
            ),
            Err(Error::InvalidParams(_))
        ));
        let zero_replicas = ReplicateConfig {
            replica_num: 0,
            preferred_segment: None,
        };
        assert!(matches!(
            master.put_start("k", 64, &[64], &zero_replicas),
            Err(Error::InvalidParams(_))
        ));
    }

    #[test]
    fn test_put_start_duplicate_key() {
        let master = service(config());
        mount(&master, "s1", 1 << 20);

        master
            .put_start("k", 64, &[64], &ReplicateConfig::default())
            .unwrap();
        assert!(matches!(
            master.put_start("k", 64, &[64], &ReplicateConfig::default()),
            Err(Error::ObjectAlreadyExists { .. })
        ));
    }

    #[test]
    fn test_put_revoke() {
        let master = service(config());
        mount(&master, "s1", 1 << 20);

        master
            .put_start("k", 64, &[64], &ReplicateConfig::default())
            .unwrap();
        master.put_revoke("k").unwrap();
        assert_eq!(master.exist_key("k").unwrap(), false);
        assert_eq!(master.query_segment("s1").unwrap().0, 0);

        // Revoking a sealed object is an invalid write
        put_complete(&master, "k2", &[64]);
        assert!(matches!(
            master.put_revoke("k2"),
            Err(Error::InvalidWrite { .. })
        ));
        assert!(matches!(
            master.put_revoke("missing"),
            Err(Error::ObjectNotFound { .. })
        ));
    }

    #[test]
    fn test_put_start_failure_leaves_nothing_allocated() {
        let mut cfg = config();
        cfg.eviction_ratio = 0.0;
        let master = service(cfg);
        mount(&master, "s1", 4096);

        let result = master.put_start(
            "big",
            6144,
            &[2048, 4096],
            &ReplicateConfig::default(),
        );
        assert!(matches!(result, Err(Error::NoAvailableHandle)));
        assert_eq!(master.query_segment("s1").unwrap().0, 0);
        assert_eq!(master.get_all_keys().len(), 0);
    }

    #[test]
    fn test_remove_frees_allocator_ranges() {
        let mut cfg = config();
        cfg.default_kv_lease_ttl_ms = 0;
        let master = service(cfg);
        mount(&master, "s1", 1 << 20);

        put_complete(&master, "k", &[4096, 4096]);
        assert_eq!(master.query_segment("s1").unwrap().0, 8192);

        master.remove("k").unwrap();
        assert_eq!(master.query_segment("s1").unwrap().0, 0);
    }

    #[test]
    fn test_replicated_put_prefers_distinct_segments() {
        let master = service(config());
        mount(&master, "s1", 1 << 20);
        mount(&master, "s2", 1 << 20);

        let replicate = ReplicateConfig {
            replica_num: 2,
            preferred_segment: None,
        };
        let descriptors = master.put_start("k", 1024, &[1024], &replicate).unwrap();
        assert_eq!(descriptors.len(), 2);
        assert_ne!(
            descriptors[0].handles[0].segment_name,
            descriptors[1].handles[0].segment_name
        );
    }

    #[test]
    fn test_mount_idempotent() {
        let master = service(config());
        let (segment, client_id) = mount(&master, "s1", 1 << 20);

        master.mount_segment(&segment, client_id).unwrap();
        assert_eq!(master.get_all_segments().len(), 1);

        master.unmount_segment(segment.id, client_id).unwrap();
        master.unmount_segment(segment.id, client_id).unwrap();
        assert!(master.get_all_segments().is_empty());
    }

    #[test]
    fn test_mount_validation() {
        let master = service(config());
        let client_id = ClientId::new();
        let bad = Segment {
            id: SegmentId::new(),
            name: String::new(),
            base: 0,
            size: 0,
            client_id,
        };
        assert!(matches!(
            master.mount_segment(&bad, client_id),
            Err(Error::InvalidParams(_))
        ));
    }

    #[test]
    fn test_unmount_sweeps_objects() {
        let master = service(config());
        let (segment, client_id) = mount(&master, "s1", 1 << 20);

        put_complete(&master, "a", &[4096]);
        put_complete(&master, "b", &[2048, 2048]);
        assert_eq!(master.get_key_count(), 2);

        master.unmount_segment(segment.id, client_id).unwrap();
        assert!(master.get_all_keys().is_empty());
        assert!(master.get_all_segments().is_empty());
    }

    #[test]
    fn test_put_start_overwrites_stale_entry_after_unmount() {
        let master = service(config());
        let (s1, client_id) = mount(&master, "s1", 1 << 20);

        master
            .put_start("k", 64, &[64], &ReplicateConfig::default())
            .unwrap();
        master.unmount_segment(s1.id, client_id).unwrap();

        mount(&master, "s2", 1 << 20);
        let descriptors = master
            .put_start("k", 64, &[64], &ReplicateConfig::default())
            .unwrap();
        assert_eq!(descriptors[0].handles[0].segment_name, "s2");
    }

    #[test]
    fn test_remove_all_skips_live_leases() {
        let mut cfg = config();
        cfg.default_kv_lease_ttl_ms = 60_000;
        let master = service(cfg);
        mount(&master, "s1", 1 << 20);

        put_complete(&master, "leased", &[64]);
        put_complete(&master, "expired", &[64]);
        // Reading grants the long lease to one of them
        master.exist_key("leased").unwrap();

        assert_eq!(master.remove_all(), 1);
        let keys = master.get_all_keys();
        assert_eq!(keys, vec!["leased".to_string()]);
    }

    #[test]
    fn test_gc_mode_removes_object_after_read() {
        let mut cfg = config();
        cfg.enable_gc = true;
        let master = service(cfg);
        mount(&master, "s1", 1 << 20);

        put_complete(&master, "k", &[64]);
        master.get_replica_list("k").unwrap();

        // Removal is scheduled one second out; allow a few GC ticks past it
        std::thread::sleep(Duration::from_millis(1300));
        assert_eq!(master.exist_key("k").unwrap(), false);
        assert!(matches!(
            master.get_replica_list("k"),
            Err(Error::ObjectNotFound { .. })
        ));
        assert_eq!(master.query_segment("s1").unwrap().0, 0);
    }

    #[test]
    fn test_eviction_under_pressure() {
        let mut cfg = config();
        cfg.eviction_ratio = 0.2;
        cfg.eviction_high_watermark_ratio = 0.8;
        let master = service(cfg);
        mount(&master, "s1", 1 << 20);

        // ~86% full with complete, lease-expired objects
        for i in 0..18 {
            put_complete(&master, &format!("k{i}"), &[50_000]);
        }
        // One in-flight write; eviction must never touch it
        master
            .put_start("wip", 64, &[64], &ReplicateConfig::default())
            .unwrap();

        std::thread::sleep(Duration::from_millis(300));

        let (used, capacity) = master.query_segment("s1").unwrap();
        assert!(
            (used as f64 / capacity as f64) <= 0.80,
            "eviction left usage at {used}/{capacity}"
        );
        assert!(master.metrics().evicted_objects() > 0);
        assert!(master.get_all_keys().contains(&"wip".to_string()));
    }

    #[test]
    fn test_ha_ops_rejected_without_ha() {
        let master = service(config());
        assert!(matches!(
            master.ping(ClientId::new()),
            Err(Error::UnavailableInCurrentMode(_))
        ));
        assert!(matches!(
            master.remount_segments(&[], ClientId::new()),
            Err(Error::UnavailableInCurrentMode(_))
        ));
    }

    #[test]
    fn test_ha_expiry_and_remount() {
        let mut cfg = config();
        cfg.enable_ha = true;
        cfg.client_live_ttl_secs = 1;
        cfg.view_version = 7;
        let master = service(cfg);

        let client_id = ClientId::new();
        let segment = Segment {
            id: SegmentId::new(),
            name: "s1".to_string(),
            base: 0x8000_0000,
            size: 1 << 20,
            client_id,
        };

        master
            .remount_segments(std::slice::from_ref(&segment), client_id)
            .unwrap();
        let (view, status) = master.ping(client_id).unwrap();
        assert_eq!(view, 7);
        assert_eq!(status, ClientStatus::Ok);
        assert_eq!(master.metrics().active_clients(), 1);

        // Remounting an alive client is a no-op
        master
            .remount_segments(std::slice::from_ref(&segment), client_id)
            .unwrap();
        assert_eq!(master.get_all_segments().len(), 1);

        // Stop pinging past the TTL plus two monitor ticks
        std::thread::sleep(Duration::from_millis(1500));
        let (_, status) = master.ping(client_id).unwrap();
        assert_eq!(status, ClientStatus::NeedRemount);
        assert!(master.get_all_segments().is_empty());
        assert_eq!(master.metrics().active_clients(), 0);

        // Re-announce and recover
        master
            .remount_segments(std::slice::from_ref(&segment), client_id)
            .unwrap();
        let (_, status) = master.ping(client_id).unwrap();
        assert_eq!(status, ClientStatus::Ok);
        assert_eq!(master.get_all_segments().len(), 1);
    }

    #[test]
    fn test_ha_expiry_sweeps_objects() {
        let mut cfg = config();
        cfg.enable_ha = true;
        cfg.client_live_ttl_secs = 1;
        let master = service(cfg);

        let client_id = ClientId::new();
        let segment = Segment {
            id: SegmentId::new(),
            name: "s1".to_string(),
            base: 0x8000_0000,
            size: 1 << 20,
            client_id,
        };
        master
            .remount_segments(std::slice::from_ref(&segment), client_id)
            .unwrap();
        put_complete(&master, "k", &[4096]);

        std::thread::sleep(Duration::from_millis(1500));
        assert!(master.get_all_keys().is_empty());
    }

    #[test]
    fn test_batch_put_start_mismatched_arrays() {
        let master = service(config());
        mount(&master, "s1", 1 << 20);

        let keys = vec!["a".to_string(), "b".to_string()];
        let value_lengths = vec![64u64];
        let slice_lengths = vec![vec![64u64]];
        let results =
            master.batch_put_start(&keys, &value_lengths, &slice_lengths, &ReplicateConfig::default());

        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(Error::InvalidParams(_))));
    }

    #[test]
    fn test_batch_ops_are_per_element() {
        let master = service(config());
        mount(&master, "s1", 1 << 20);
        put_complete(&master, "a", &[64]);

        let keys = vec!["a".to_string(), "missing".to_string()];
        let exists = master.batch_exist_key(&keys);
        assert_eq!(exists[0].as_ref().unwrap(), &true);
        assert_eq!(exists[1].as_ref().unwrap(), &false);

        let ends = master.batch_put_end(&keys);
        assert!(ends[0].is_ok());
        assert!(matches!(ends[1], Err(Error::ObjectNotFound { .. })));

        let gets = master.batch_get_replica_list(&keys);
        assert!(gets[0].is_ok());
        assert!(matches!(gets[1], Err(Error::ObjectNotFound { .. })));
    }

    #[test]
    fn test_get_fsdir() {
        let master = service(config());
        assert!(matches!(master.get_fsdir(), Err(Error::InvalidParams(_))));

        let mut cfg = config();
        cfg.cluster_id = "cluster-7".to_string();
        let master = service(cfg);
        assert_eq!(master.get_fsdir().unwrap(), "cluster-7");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut cfg = config();
        cfg.eviction_ratio = 2.0;
        assert!(MasterService::new(cfg).is_err());
    }
}
