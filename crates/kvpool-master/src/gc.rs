//! Garbage collection and eviction.
//!
//! One background thread owns both: it drains the bounded GC queue
//! into a thread-local min-heap, removes every task whose delay has
//! passed, refreshes the usage gauges, and runs a batch eviction pass
//! when usage crosses the high watermark or an allocation failure
//! raised the demand flag.

use crate::service::MasterInner;
use kvpool_common::{Error, ReplicaStatus};
use rand::Rng;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Delay between a GC-mode read and the scheduled removal
pub(crate) const GC_DELAY_MS: u64 = 1000;

/// Sleep between GC passes
pub(crate) const GC_THREAD_SLEEP_MS: u64 = 10;

/// Bound on queued-but-undrained GC tasks. Overflow is an operational
/// signal (the read proceeds unscheduled), not a correctness bug.
pub(crate) const GC_QUEUE_CAPACITY: usize = 16 * 1024;

/// A scheduled object removal
pub(crate) struct GcTask {
    pub key: String,
    pub ready_at: Instant,
}

impl PartialEq for GcTask {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at
    }
}

impl Eq for GcTask {}

impl PartialOrd for GcTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GcTask {
    // Reversed so the max-heap pops the earliest deadline first
    fn cmp(&self, other: &Self) -> Ordering {
        other.ready_at.cmp(&self.ready_at)
    }
}

impl MasterInner {
    /// GC thread body. Runs until the service shuts down.
    pub(crate) fn gc_loop(&self) {
        debug!("gc thread started");
        let mut pending: BinaryHeap<GcTask> = BinaryHeap::new();

        while self.running.load(AtomicOrdering::Acquire) {
            while let Some(task) = self.gc_queue.pop() {
                pending.push(task);
            }

            let now = Instant::now();
            while let Some(task) = pending.peek() {
                if task.ready_at > now {
                    break;
                }
                let task = pending.pop().expect("peeked task");
                match self.remove(&task.key) {
                    Ok(()) => debug!(key = %task.key, "gc removed object"),
                    // Re-read or already gone since scheduling; both expected
                    Err(Error::ObjectNotFound { .. }) | Err(Error::ObjectHasLease { .. }) => {}
                    Err(e) => warn!(key = %task.key, error = %e, "gc remove failed"),
                }
            }

            self.refresh_usage();
            let used_ratio = self.metrics.global_used_ratio();
            let ratio = self.config.eviction_ratio;
            let high_watermark = self.config.eviction_high_watermark_ratio;
            if used_ratio > high_watermark
                || (self.need_eviction.load(AtomicOrdering::Relaxed) && ratio > 0.0)
            {
                self.batch_evict(ratio.max(used_ratio - high_watermark + ratio));
            }

            std::thread::sleep(Duration::from_millis(GC_THREAD_SLEEP_MS));
        }
        debug!("gc thread stopped");
    }

    /// Evict roughly `target_ratio` of stored objects.
    ///
    /// Shards are visited from a random start so repeated passes do not
    /// always drain the same shards. Only objects that are lease
    /// expired and fully complete qualify; within a shard the oldest
    /// lease deadlines go first, found with a partial sort rather than
    /// sorting the whole shard.
    pub(crate) fn batch_evict(&self, target_ratio: f64) {
        let now = Instant::now();
        let num_shards = self.store.num_shards();
        let mut evicted = 0usize;
        let mut object_count = 0usize;
        let mut freed_bytes = 0u64;

        let start = rand::thread_rng().gen_range(0..num_shards);
        for i in 0..num_shards {
            let mut shard = self.store.lock_shard((start + i) % num_shards);
            // Cumulative count drives the per-shard quota below
            object_count += shard.len();

            let ideal = (object_count as f64 * target_ratio).ceil() as i64 - evicted as i64;
            if ideal <= 0 {
                continue;
            }

            let mut candidates: Vec<Instant> = shard
                .values()
                .filter(|m| {
                    m.is_lease_expired(now) && m.status_diff(ReplicaStatus::Complete).is_none()
                })
                .map(|m| m.lease_expiry())
                .collect();
            if candidates.is_empty() {
                continue;
            }

            let evict_num = (ideal as usize).min(candidates.len());
            let (_, threshold, _) = candidates.select_nth_unstable(evict_num - 1);
            let threshold = *threshold;

            let mut shard_evicted = 0usize;
            shard.retain(|_, m| {
                let qualifies = shard_evicted < evict_num
                    && m.lease_expiry() <= threshold
                    && m.status_diff(ReplicaStatus::Complete).is_none();
                if qualifies {
                    shard_evicted += 1;
                    freed_bytes += m.total_bytes();
                }
                !qualifies
            });
            evicted += shard_evicted;
        }

        if evicted > 0 {
            self.need_eviction.store(false, AtomicOrdering::Relaxed);
            self.metrics.inc_eviction_success(evicted as u64, freed_bytes);
            info!(evicted, freed_bytes, "eviction pass finished");
        } else {
            if object_count == 0 {
                // Nothing stored; demand eviction cannot make progress
                self.need_eviction.store(false, AtomicOrdering::Relaxed);
            }
            self.metrics.inc_eviction_fail();
        }
    }
}
