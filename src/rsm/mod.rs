//! Replicated state machine runtime.
//!
//! - [`ident`] - client-scoped command identity
//! - [`sequence`] - per-client dedup tracking, persisted per batch
//! - [`write_prep`] - pre-replication admission gate
//! - [`apply`] - commit-order apply pipeline and atomic batch staging
//! - [`snapshot`] - reference-counted pinned read views
//! - [`coordinator`] - wiring, lifecycle, and the replication driver seam

pub mod apply;
pub mod coordinator;
pub mod ident;
pub mod sequence;
pub mod snapshot;
pub mod write_prep;

use crate::core::error::{EngineError, StrataError, StrataResult};
use crate::engine::StorageEngine;
use crate::rsm::apply::ApplyContext;
use crate::rsm::ident::CommandId;
use crate::rsm::snapshot::SnapshotView;
use crate::rsm::write_prep::WritePrepDisposition;
use crate::schema::registry::{Layer, SchemaRegistry};

/// How a write command was concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// The apply handler ran and its effects committed.
    Applied,
    /// Detected as a replay; the original acknowledgement is replayed.
    Duplicate,
    /// Rejected by the write-prep gate before replication.
    Rejected,
    /// The apply handler failed; nothing was written and the client may
    /// retry with the same identity.
    ApplyFailed,
}

/// Reply delivered to the client for one write command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReply {
    /// Application-defined result code.
    pub code: i32,
    pub status: WriteStatus,
}

/// Application hooks into the replication pipeline.
///
/// `write_prep` runs before a command is proposed to consensus; `apply` runs
/// once per committed command in commit order; `read` serves
/// snapshot-consistent reads. Implementations must be deterministic in
/// `apply`: every replica applies the same committed commands in the same
/// order.
pub trait StateMachine: Send + Sync {
    /// Admission check before replication. Rejection replies to the client
    /// immediately; no log entry is written. Defaults to admitting
    /// everything.
    fn write_prep(
        &self,
        id: &CommandId,
        payload: &[u8],
        storage: &StorageView<'_>,
    ) -> WritePrepDisposition {
        let _ = (id, payload, storage);
        WritePrepDisposition::Proceed
    }

    /// Post-commit apply. Stage key-value writes through the context; they
    /// commit atomically together with the sequence tracker's bookkeeping.
    /// `Ok(code)` acknowledges the command with `code`; `Err(code)` discards
    /// everything staged and surfaces `code` as the reply.
    fn apply(&self, id: &CommandId, payload: &[u8], ctx: &mut ApplyContext<'_>)
        -> Result<i32, i32>;

    /// Snapshot-consistent read. Returns the number of bytes written into
    /// `reply_buf`.
    fn read(
        &self,
        id: &CommandId,
        request: &[u8],
        view: &SnapshotView,
        reply_buf: &mut [u8],
    ) -> StrataResult<usize>;
}

/// Resolve an application-visible partition name to its qualified engine
/// name. Application-layer names win; internal-layer partitions are
/// readable but writable only when not marked read-only to upper layers.
pub(crate) fn resolve_partition(
    registry: &SchemaRegistry,
    name: &str,
    for_write: bool,
) -> StrataResult<String> {
    if let Some(descriptor) = registry.lookup(Layer::Application, name) {
        return Ok(format!("{}{}", descriptor.namespace_prefix, descriptor.name));
    }
    if let Some(descriptor) = registry.lookup(Layer::Internal, name) {
        if for_write && descriptor.read_only_to_upper_layers {
            return Err(StrataError::invalid(format!(
                "partition '{name}' is read-only to the application layer"
            )));
        }
        return Ok(format!("{}{}", descriptor.namespace_prefix, descriptor.name));
    }
    Err(EngineError::PartitionNotFound {
        name: name.to_string(),
    }
    .into())
}

/// Read-only view of the latest durable state, handed to write-prep hooks.
pub struct StorageView<'a> {
    engine: &'a dyn StorageEngine,
    registry: &'a SchemaRegistry,
}

impl<'a> StorageView<'a> {
    pub(crate) fn new(engine: &'a dyn StorageEngine, registry: &'a SchemaRegistry) -> Self {
        Self { engine, registry }
    }

    /// Point lookup against the latest durable state.
    pub fn get(&self, partition: &str, key: &[u8]) -> StrataResult<Option<Vec<u8>>> {
        let qualified = resolve_partition(self.registry, partition, false)?;
        Ok(self.engine.get(&qualified, key)?)
    }

    /// The engine's current durable sequence number.
    pub fn current_sequence(&self) -> u64 {
        self.engine.current_sequence()
    }
}
