//! Core type definitions for kvpool
//!
//! This module defines the fundamental types used throughout the system:
//! identifiers, segment and replica metadata, and the descriptor shapes
//! handed to clients for out-of-band data transfer.

use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Maximum size of a single object slice (64 MiB).
///
/// Slices larger than this cannot be placed; clients are expected to
/// split values into transfer-engine-sized chunks.
pub const MAX_SLICE_SIZE: u64 = 64 * 1024 * 1024;

/// Unique identifier for a client (worker process contributing memory)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, From, Into)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Generate a new random client ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self.0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a mounted segment
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, From, Into)]
pub struct SegmentId(Uuid);

impl SegmentId {
    /// Generate a new random segment ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SegmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegmentId({})", self.0)
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A contiguous remote-addressable memory range contributed by a client.
///
/// The master only ever stores this description; it never dereferences
/// `base`. Transfers against the range happen client-to-client through
/// the data-plane engine, addressed by `name`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Segment identifier, chosen by the mounting client
    pub id: SegmentId,
    /// Client-chosen name, resolvable by the transfer engine
    pub name: String,
    /// Remote base address of the range
    pub base: u64,
    /// Size of the range in bytes
    pub size: u64,
    /// Client that owns the backing memory
    pub client_id: ClientId,
}

/// Status of an allocated buffer (handle) within a segment
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufStatus {
    /// Allocated, data not yet written
    Init,
    /// Data transfer finished
    Complete,
    /// Transfer failed; range still reserved until the replica is dropped
    Failed,
    /// The owning allocator was torn down; the handle is invalid
    Unregistered,
}

impl fmt::Display for BufStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
            Self::Unregistered => write!(f, "unregistered"),
        }
    }
}

/// Status of one replica of an object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaStatus {
    /// PutStart issued, data still in flight
    Processing,
    /// All handles written and sealed by PutEnd
    Complete,
    /// Write failed
    Failed,
}

impl fmt::Display for ReplicaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Processing => write!(f, "processing"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Client liveness as observed by the master (HA mode)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientStatus {
    /// Client pinged within its TTL; segments are live
    Ok,
    /// Client expired; it must re-announce its segments via ReMountSegment
    NeedRemount,
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::NeedRemount => write!(f, "need_remount"),
        }
    }
}

/// Monotonically increasing id of the master's visible cluster membership
pub type ViewVersion = u64;

/// On-the-wire description of one allocated buffer.
///
/// `remote_address` is directly usable by the data-plane transfer
/// engine; `segment_name` resolves to a transport segment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferDescriptor {
    pub segment_name: String,
    pub remote_address: u64,
    pub size: u64,
    pub status: BufStatus,
}

/// On-the-wire description of one replica placement
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaDescriptor {
    pub status: ReplicaStatus,
    pub handles: Vec<BufferDescriptor>,
}

/// Replication preferences for a PutStart request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicateConfig {
    /// Number of replicas to place
    pub replica_num: usize,
    /// If set, restrict placement to this segment when it is eligible
    pub preferred_segment: Option<SegmentId>,
}

impl Default for ReplicateConfig {
    fn default() -> Self {
        Self {
            replica_num: 1,
            preferred_segment: None,
        }
    }
}

impl fmt::Display for ReplicateConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.preferred_segment {
            Some(seg) => write!(f, "replica_num={}, preferred_segment={}", self.replica_num, seg),
            None => write!(f, "replica_num={}", self.replica_num),
        }
    }
}
