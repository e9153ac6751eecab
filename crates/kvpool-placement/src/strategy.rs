//! Allocation strategy implementations

use kvpool_allocator::{AllocatedBuffer, BufferAllocator};
use kvpool_common::{ReplicateConfig, SegmentId};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Policy choosing which segment satisfies one slice of a replica.
///
/// Implementations must not hold locks of their own; the caller already
/// holds the shared allocator access for the whole multi-slice
/// allocation.
pub trait AllocationStrategy: Send + Sync {
    /// Reserve `size` bytes from one of `allocators`.
    ///
    /// `exclude` carries the segments already used by earlier replicas
    /// of the same object; the strategy avoids them when it can.
    /// Returns `None` when no eligible segment fits the slice.
    fn allocate(
        &self,
        allocators: &HashMap<SegmentId, Arc<BufferAllocator>>,
        size: u64,
        config: &ReplicateConfig,
        exclude: &HashSet<SegmentId>,
    ) -> Option<AllocatedBuffer>;
}

/// Default strategy: uniform random over eligible segments, weighted by
/// free bytes.
///
/// Selection rules, in order:
/// 1. A segment is eligible when its free bytes cover the slice.
/// 2. If the config names a preferred segment and it is eligible, the
///    choice is restricted to it.
/// 3. Segments in `exclude` are avoided unless nothing else is
///    eligible (fewer segments than replicas).
#[derive(Debug, Default)]
pub struct RandomStrategy;

impl RandomStrategy {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Pick one candidate index, weighted by free bytes
    fn pick_weighted(candidates: &[&Arc<BufferAllocator>]) -> usize {
        let total: u64 = candidates.iter().map(|a| a.free_bytes()).sum();
        if total == 0 {
            return 0;
        }
        let mut point = rand::thread_rng().gen_range(0..total);
        for (i, allocator) in candidates.iter().enumerate() {
            let weight = allocator.free_bytes();
            if point < weight {
                return i;
            }
            point -= weight;
        }
        candidates.len() - 1
    }
}

impl AllocationStrategy for RandomStrategy {
    fn allocate(
        &self,
        allocators: &HashMap<SegmentId, Arc<BufferAllocator>>,
        size: u64,
        config: &ReplicateConfig,
        exclude: &HashSet<SegmentId>,
    ) -> Option<AllocatedBuffer> {
        let mut eligible: Vec<&Arc<BufferAllocator>> = allocators
            .values()
            .filter(|a| a.free_bytes() >= size)
            .collect();
        if eligible.is_empty() {
            return None;
        }

        if let Some(preferred) = config.preferred_segment {
            if let Some(chosen) = eligible.iter().find(|a| a.segment_id() == preferred) {
                if let Some(buf) = chosen.allocate(size) {
                    return Some(buf);
                }
                debug!(segment_id = %preferred, "preferred segment refused allocation");
            }
        }

        // Prefer segments not yet holding a replica of this object
        let mut candidates: Vec<&Arc<BufferAllocator>> = eligible
            .iter()
            .copied()
            .filter(|a| !exclude.contains(&a.segment_id()))
            .collect();
        if candidates.is_empty() {
            candidates = std::mem::take(&mut eligible);
        }

        // Free-byte counts can move under us between the eligibility
        // snapshot and the allocation, so retry over the remaining
        // candidates instead of failing on the first refusal.
        while !candidates.is_empty() {
            let idx = Self::pick_weighted(&candidates);
            if let Some(buf) = candidates[idx].allocate(size) {
                return Some(buf);
            }
            candidates.swap_remove(idx);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvpool_common::{ClientId, Segment};

    fn segment(name: &str, size: u64) -> Segment {
        Segment {
            id: SegmentId::new(),
            name: name.to_string(),
            base: 0x1000_0000,
            size,
            client_id: ClientId::new(),
        }
    }

    fn table(segments: &[Segment]) -> HashMap<SegmentId, Arc<BufferAllocator>> {
        segments
            .iter()
            .map(|s| (s.id, BufferAllocator::new(s)))
            .collect()
    }

    #[test]
    fn test_no_fit_returns_none() {
        let strategy = RandomStrategy::new();
        let allocators = table(&[segment("s1", 128)]);
        let result = strategy.allocate(
            &allocators,
            256,
            &ReplicateConfig::default(),
            &HashSet::new(),
        );
        assert!(result.is_none());
    }

    #[test]
    fn test_only_eligible_segment_is_used() {
        let strategy = RandomStrategy::new();
        let small = segment("small", 128);
        let large = segment("large", 1 << 20);
        let allocators = table(&[small, large.clone()]);

        for _ in 0..16 {
            let buf = strategy
                .allocate(&allocators, 4096, &ReplicateConfig::default(), &HashSet::new())
                .unwrap();
            assert_eq!(buf.segment_name(), "large");
            assert_eq!(buf.segment_id(), large.id);
        }
    }

    #[test]
    fn test_preferred_segment_honored() {
        let strategy = RandomStrategy::new();
        let a = segment("a", 1 << 20);
        let b = segment("b", 1 << 20);
        let allocators = table(&[a.clone(), b]);

        let config = ReplicateConfig {
            replica_num: 1,
            preferred_segment: Some(a.id),
        };
        for _ in 0..16 {
            let buf = strategy
                .allocate(&allocators, 1024, &config, &HashSet::new())
                .unwrap();
            assert_eq!(buf.segment_id(), a.id);
        }
    }

    #[test]
    fn test_ineligible_preferred_segment_falls_through() {
        let strategy = RandomStrategy::new();
        let tiny = segment("tiny", 64);
        let big = segment("big", 1 << 20);
        let allocators = table(&[tiny.clone(), big]);

        let config = ReplicateConfig {
            replica_num: 1,
            preferred_segment: Some(tiny.id),
        };
        let buf = strategy
            .allocate(&allocators, 4096, &config, &HashSet::new())
            .unwrap();
        assert_eq!(buf.segment_name(), "big");
    }

    #[test]
    fn test_exclude_drives_distinct_placement() {
        let strategy = RandomStrategy::new();
        let a = segment("a", 1 << 20);
        let b = segment("b", 1 << 20);
        let allocators = table(&[a.clone(), b.clone()]);

        let mut exclude = HashSet::new();
        exclude.insert(a.id);
        for _ in 0..16 {
            let buf = strategy
                .allocate(&allocators, 1024, &ReplicateConfig::default(), &exclude)
                .unwrap();
            assert_eq!(buf.segment_id(), b.id);
        }
    }

    #[test]
    fn test_exclude_falls_back_when_all_excluded() {
        let strategy = RandomStrategy::new();
        let a = segment("a", 1 << 20);
        let allocators = table(&[a.clone()]);

        let mut exclude = HashSet::new();
        exclude.insert(a.id);
        // Fewer segments than replicas: reuse is better than failing
        let buf = strategy
            .allocate(&allocators, 1024, &ReplicateConfig::default(), &exclude)
            .unwrap();
        assert_eq!(buf.segment_id(), a.id);
    }
}
