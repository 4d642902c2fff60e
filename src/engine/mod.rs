//! Storage engine contract.
//!
//! The replication layer consumes the embedded engine only through this
//! surface: partition creation at startup from enumerated descriptors, point
//! lookup, atomic multi-key batch commit, pinned snapshots tied to a durable
//! sequence number, and retrieval of the current durable sequence number.
//! The engine's internal compaction, caching, and on-disk format are the
//! engine's own business.

pub mod memory;

use std::sync::Arc;

use crate::core::error::EngineError;
use crate::schema::registry::PartitionDescriptor;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// One staged key-value write inside an atomic batch.
#[derive(Debug, Clone)]
pub struct StagedWrite {
    /// Qualified partition name (namespace prefix + descriptor name).
    pub partition: String,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// An ordered multiset of staged writes committed to the engine as a single
/// indivisible operation. Either every staged write becomes durable or none
/// does; partial application is never observable.
#[derive(Debug, Default)]
pub struct WriteBatch {
    writes: Vec<StagedWrite>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage one write. Order is preserved; a later write to the same key
    /// wins within the batch.
    pub fn put(&mut self, partition: impl Into<String>, key: Vec<u8>, value: Vec<u8>) {
        self.writes.push(StagedWrite {
            partition: partition.into(),
            key,
            value,
        });
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn writes(&self) -> &[StagedWrite] {
        &self.writes
    }
}

/// A read view pinned at a specific durable sequence number.
///
/// Reads through a snapshot never observe writes committed after its
/// sequence number and never block on concurrent commits.
pub trait EngineSnapshot: Send + Sync {
    /// The sequence number this view is pinned at.
    fn sequence(&self) -> u64;

    /// Point lookup as of the pinned sequence number.
    fn get(&self, partition: &str, key: &[u8]) -> EngineResult<Option<Vec<u8>>>;
}

/// The embedded storage engine contract.
pub trait StorageEngine: Send + Sync {
    /// Open (creating if absent) the partition described by `descriptor`.
    /// Called once per registered descriptor during startup.
    fn open_partition(&self, descriptor: &PartitionDescriptor) -> EngineResult<()>;

    /// Whether a partition with the given qualified name is open.
    fn has_partition(&self, partition: &str) -> bool;

    /// Point lookup against the latest durable state.
    fn get(&self, partition: &str, key: &[u8]) -> EngineResult<Option<Vec<u8>>>;

    /// Commit a batch atomically. Returns the new durable sequence number.
    /// `sync` requests an fsync before returning.
    fn commit_batch(&self, batch: WriteBatch, sync: bool) -> EngineResult<u64>;

    /// The engine's current durable sequence number.
    fn current_sequence(&self) -> u64;

    /// Create the underlying resource for a read view pinned at `sequence`
    /// (or at the current durable sequence number if `None`). The caller owns
    /// the resource's lifetime and must pair it with [`unpin_snapshot`].
    ///
    /// [`unpin_snapshot`]: StorageEngine::unpin_snapshot
    fn pin_snapshot(&self, sequence: Option<u64>) -> EngineResult<Arc<dyn EngineSnapshot>>;

    /// Destroy the pinned-view resource at `sequence`.
    fn unpin_snapshot(&self, sequence: u64) -> EngineResult<()>;
}
