//! kvpool Master - the in-memory control plane
//!
//! This crate implements the metadata master of the kvpool cache:
//! - Segment registry with two-phase unmount
//! - Sharded object metadata store with scoped accessors
//! - Lease tracking, delayed GC, and watermark-driven eviction
//! - Client liveness monitoring (HA mode)
//! - The full request surface with batch forms
//!
//! Object bytes never pass through this crate; the master only places
//! and describes them.

mod gc;
mod monitor;

pub mod metadata;
pub mod metrics;
pub mod segment;
pub mod service;

pub use metrics::{MasterMetrics, MasterOp};
pub use service::MasterService;
