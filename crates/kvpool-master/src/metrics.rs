//! Master metrics for Prometheus
//!
//! Tracks capacity, usage, client liveness, eviction outcomes, and
//! per-operation request counts. The collector is plain atomics behind
//! an `Arc` so tests can inject their own instance and inspect it
//! directly.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Master operation types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MasterOp {
    ExistKey,
    GetReplicaList,
    PutStart,
    PutEnd,
    PutRevoke,
    Remove,
    RemoveAll,
    MountSegment,
    ReMountSegment,
    UnmountSegment,
    Ping,
}

impl MasterOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            MasterOp::ExistKey => "ExistKey",
            MasterOp::GetReplicaList => "GetReplicaList",
            MasterOp::PutStart => "PutStart",
            MasterOp::PutEnd => "PutEnd",
            MasterOp::PutRevoke => "PutRevoke",
            MasterOp::Remove => "Remove",
            MasterOp::RemoveAll => "RemoveAll",
            MasterOp::MountSegment => "MountSegment",
            MasterOp::ReMountSegment => "ReMountSegment",
            MasterOp::UnmountSegment => "UnmountSegment",
            MasterOp::Ping => "Ping",
        }
    }
}

/// Per-operation request counters
#[derive(Debug, Default)]
struct OpCounters {
    requests_total: AtomicU64,
    requests_failed: AtomicU64,
}

/// Master metrics collector
#[derive(Debug)]
pub struct MasterMetrics {
    /// Clients currently considered alive (HA)
    active_clients: AtomicU64,
    /// Total mounted capacity in bytes
    total_capacity: AtomicU64,
    /// Bytes handed out across all segments (refreshed by the GC pass)
    used_bytes: AtomicU64,
    /// Objects currently stored (refreshed by the GC pass)
    key_count: AtomicU64,
    /// Eviction outcomes
    eviction_success_total: AtomicU64,
    eviction_fail_total: AtomicU64,
    evicted_objects_total: AtomicU64,
    evicted_bytes_total: AtomicU64,
    /// Per-segment usage: name -> (used, capacity)
    segment_usage: RwLock<HashMap<String, (u64, u64)>>,
    /// Per-operation counters
    operations: RwLock<HashMap<MasterOp, OpCounters>>,
    /// Start time for uptime
    start_time: Instant,
}

impl MasterMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            active_clients: AtomicU64::new(0),
            total_capacity: AtomicU64::new(0),
            used_bytes: AtomicU64::new(0),
            key_count: AtomicU64::new(0),
            eviction_success_total: AtomicU64::new(0),
            eviction_fail_total: AtomicU64::new(0),
            evicted_objects_total: AtomicU64::new(0),
            evicted_bytes_total: AtomicU64::new(0),
            segment_usage: RwLock::new(HashMap::new()),
            operations: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Record one request for `op`
    pub fn record_op(&self, op: MasterOp, ok: bool) {
        let mut ops = self.operations.write();
        let counters = ops.entry(op).or_default();
        counters.requests_total.fetch_add(1, Ordering::Relaxed);
        if !ok {
            counters.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn inc_active_clients(&self) {
        self.active_clients.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_active_clients(&self) {
        self.active_clients.fetch_sub(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn active_clients(&self) -> u64 {
        self.active_clients.load(Ordering::Relaxed)
    }

    pub fn add_capacity(&self, bytes: u64) {
        self.total_capacity.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn sub_capacity(&self, bytes: u64) {
        self.total_capacity.fetch_sub(bytes, Ordering::Relaxed);
    }

    #[must_use]
    pub fn total_capacity(&self) -> u64 {
        self.total_capacity.load(Ordering::Relaxed)
    }

    /// Replace the usage snapshot (called once per GC pass)
    pub fn set_usage(&self, used: u64, per_segment: HashMap<String, (u64, u64)>) {
        self.used_bytes.store(used, Ordering::Relaxed);
        *self.segment_usage.write() = per_segment;
    }

    pub fn set_key_count(&self, count: u64) {
        self.key_count.store(count, Ordering::Relaxed);
    }

    #[must_use]
    pub fn key_count(&self) -> u64 {
        self.key_count.load(Ordering::Relaxed)
    }

    /// Global used ratio; 0.0 when nothing is mounted
    #[must_use]
    pub fn global_used_ratio(&self) -> f64 {
        let capacity = self.total_capacity.load(Ordering::Relaxed);
        if capacity == 0 {
            return 0.0;
        }
        self.used_bytes.load(Ordering::Relaxed) as f64 / capacity as f64
    }

    pub fn inc_eviction_success(&self, objects: u64, bytes: u64) {
        self.eviction_success_total.fetch_add(1, Ordering::Relaxed);
        self.evicted_objects_total.fetch_add(objects, Ordering::Relaxed);
        self.evicted_bytes_total.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_eviction_fail(&self) {
        self.eviction_fail_total.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn evicted_objects(&self) -> u64 {
        self.evicted_objects_total.load(Ordering::Relaxed)
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let mut output = String::with_capacity(4 * 1024);

        let uptime_secs = self.start_time.elapsed().as_secs();
        writeln!(output, "# HELP kvpool_master_uptime_seconds Master uptime in seconds").unwrap();
        writeln!(output, "# TYPE kvpool_master_uptime_seconds counter").unwrap();
        writeln!(output, "kvpool_master_uptime_seconds {}", uptime_secs).unwrap();

        writeln!(output, "# HELP kvpool_master_active_clients Clients within their ping TTL").unwrap();
        writeln!(output, "# TYPE kvpool_master_active_clients gauge").unwrap();
        writeln!(output, "kvpool_master_active_clients {}",
            self.active_clients.load(Ordering::Relaxed)).unwrap();

        writeln!(output, "# HELP kvpool_master_capacity_bytes Total mounted capacity").unwrap();
        writeln!(output, "# TYPE kvpool_master_capacity_bytes gauge").unwrap();
        writeln!(output, "kvpool_master_capacity_bytes {}",
            self.total_capacity.load(Ordering::Relaxed)).unwrap();

        writeln!(output, "# HELP kvpool_master_used_bytes Bytes allocated across segments").unwrap();
        writeln!(output, "# TYPE kvpool_master_used_bytes gauge").unwrap();
        writeln!(output, "kvpool_master_used_bytes {}",
            self.used_bytes.load(Ordering::Relaxed)).unwrap();

        writeln!(output, "# HELP kvpool_master_used_ratio Global used-capacity ratio").unwrap();
        writeln!(output, "# TYPE kvpool_master_used_ratio gauge").unwrap();
        writeln!(output, "kvpool_master_used_ratio {}", self.global_used_ratio()).unwrap();

        writeln!(output, "# HELP kvpool_master_keys Objects currently stored").unwrap();
        writeln!(output, "# TYPE kvpool_master_keys gauge").unwrap();
        writeln!(output, "kvpool_master_keys {}", self.key_count.load(Ordering::Relaxed)).unwrap();

        let usage = self.segment_usage.read();
        if !usage.is_empty() {
            writeln!(output, "# HELP kvpool_segment_used_bytes Bytes allocated per segment").unwrap();
            writeln!(output, "# TYPE kvpool_segment_used_bytes gauge").unwrap();
            writeln!(output, "# HELP kvpool_segment_capacity_bytes Capacity per segment").unwrap();
            writeln!(output, "# TYPE kvpool_segment_capacity_bytes gauge").unwrap();
            for (name, (used, capacity)) in usage.iter() {
                writeln!(output, "kvpool_segment_used_bytes{{segment=\"{}\"}} {}", name, used).unwrap();
                writeln!(output, "kvpool_segment_capacity_bytes{{segment=\"{}\"}} {}", name, capacity).unwrap();
            }
        }
        drop(usage);

        writeln!(output, "# HELP kvpool_master_eviction_passes_total Eviction passes by outcome").unwrap();
        writeln!(output, "# TYPE kvpool_master_eviction_passes_total counter").unwrap();
        writeln!(output, "kvpool_master_eviction_passes_total{{outcome=\"success\"}} {}",
            self.eviction_success_total.load(Ordering::Relaxed)).unwrap();
        writeln!(output, "kvpool_master_eviction_passes_total{{outcome=\"fail\"}} {}",
            self.eviction_fail_total.load(Ordering::Relaxed)).unwrap();

        writeln!(output, "# HELP kvpool_master_evicted_objects_total Objects evicted").unwrap();
        writeln!(output, "# TYPE kvpool_master_evicted_objects_total counter").unwrap();
        writeln!(output, "kvpool_master_evicted_objects_total {}",
            self.evicted_objects_total.load(Ordering::Relaxed)).unwrap();

        writeln!(output, "# HELP kvpool_master_evicted_bytes_total Bytes freed by eviction").unwrap();
        writeln!(output, "# TYPE kvpool_master_evicted_bytes_total counter").unwrap();
        writeln!(output, "kvpool_master_evicted_bytes_total {}",
            self.evicted_bytes_total.load(Ordering::Relaxed)).unwrap();

        let ops = self.operations.read();
        writeln!(output, "# HELP kvpool_master_requests_total Requests by operation and outcome").unwrap();
        writeln!(output, "# TYPE kvpool_master_requests_total counter").unwrap();
        for (op, counters) in ops.iter() {
            let total = counters.requests_total.load(Ordering::Relaxed);
            let failed = counters.requests_failed.load(Ordering::Relaxed);
            writeln!(output, "kvpool_master_requests_total{{operation=\"{}\",outcome=\"ok\"}} {}",
                op.as_str(), total - failed).unwrap();
            writeln!(output, "kvpool_master_requests_total{{operation=\"{}\",outcome=\"error\"}} {}",
                op.as_str(), failed).unwrap();
        }

        output
    }
}

impl Default for MasterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_op() {
        let metrics = MasterMetrics::new();
        metrics.record_op(MasterOp::PutStart, true);
        metrics.record_op(MasterOp::PutStart, false);
        metrics.record_op(MasterOp::Remove, true);

        let output = metrics.export_prometheus();
        assert!(output
            .contains("kvpool_master_requests_total{operation=\"PutStart\",outcome=\"ok\"} 1"));
        assert!(output
            .contains("kvpool_master_requests_total{operation=\"PutStart\",outcome=\"error\"} 1"));
        assert!(output.contains("Remove"));
    }

    #[test]
    fn test_used_ratio() {
        let metrics = MasterMetrics::new();
        assert_eq!(metrics.global_used_ratio(), 0.0);

        metrics.add_capacity(1000);
        metrics.set_usage(250, HashMap::new());
        assert!((metrics.global_used_ratio() - 0.25).abs() < f64::EPSILON);

        metrics.sub_capacity(1000);
        assert_eq!(metrics.global_used_ratio(), 0.0);
    }

    #[test]
    fn test_eviction_counters() {
        let metrics = MasterMetrics::new();
        metrics.inc_eviction_success(3, 4096);
        metrics.inc_eviction_fail();

        let output = metrics.export_prometheus();
        assert!(output.contains("kvpool_master_evicted_objects_total 3"));
        assert!(output.contains("kvpool_master_evicted_bytes_total 4096"));
    }
}
