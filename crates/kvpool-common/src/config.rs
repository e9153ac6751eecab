//! Configuration types for kvpool
//!
//! This module defines the master configuration structure shared by the
//! daemon and the embedded test harnesses.

use crate::error::{Error, Result};
use crate::types::ViewVersion;
use serde::{Deserialize, Serialize};

/// Master service configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Enable read-then-delete GC mode: a successful GetReplicaList
    /// schedules removal instead of granting a lease
    pub enable_gc: bool,
    /// Lease granted on reads when GC mode is off (milliseconds)
    pub default_kv_lease_ttl_ms: u64,
    /// Fraction of objects to evict per eviction pass, in [0, 1]
    pub eviction_ratio: f64,
    /// Used-capacity ratio above which eviction triggers, in [0, 1]
    pub eviction_high_watermark_ratio: f64,
    /// Enable HA mode: client liveness monitoring and re-mounts
    pub enable_ha: bool,
    /// Seconds without a ping after which a client expires (HA only)
    pub client_live_ttl_secs: u64,
    /// Cluster membership view announced to clients (HA only)
    pub view_version: ViewVersion,
    /// Cluster identifier returned by GetFsdir
    pub cluster_id: String,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            enable_gc: false,
            default_kv_lease_ttl_ms: 5_000,
            eviction_ratio: 0.05,
            eviction_high_watermark_ratio: 0.95,
            enable_ha: false,
            client_live_ttl_secs: 10,
            view_version: 0,
            cluster_id: String::new(),
        }
    }
}

impl MasterConfig {
    /// Validate ratio bounds
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.eviction_ratio) {
            return Err(Error::invalid_params(format!(
                "eviction_ratio must be between 0.0 and 1.0, got {}",
                self.eviction_ratio
            )));
        }
        if !(0.0..=1.0).contains(&self.eviction_high_watermark_ratio) {
            return Err(Error::invalid_params(format!(
                "eviction_high_watermark_ratio must be between 0.0 and 1.0, got {}",
                self.eviction_high_watermark_ratio
            )));
        }
        Ok(())
    }
}
