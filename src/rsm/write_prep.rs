//! Pre-replication admission gate.
//!
//! Runs once, synchronously, before a command is handed to the replication
//! driver. A rejected command is answered immediately: no replication
//! round-trip, no log entry, no apply. The gate also short-circuits commands
//! whose identity is already durably recorded as applied, replaying the
//! original acknowledgement. Both checks are advisory, not a correctness
//! boundary: the apply pipeline re-checks after commit, so a race across a
//! leadership change cannot double-apply.

use std::sync::Arc;

use crate::core::error::StrataResult;
use crate::engine::StorageEngine;
use crate::rsm::ident::CommandId;
use crate::rsm::sequence::{self, AppliedRecord};
use crate::rsm::{StateMachine, StorageView};
use crate::schema::registry::SchemaRegistry;

/// Disposition returned by the application's write-prep hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePrepDisposition {
    /// Propose the command to consensus.
    Proceed,
    /// Reply to the client with `code` and never propose the command.
    Reject(i32),
}

/// Gate outcome, including the layer's own duplicate fast path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePrepOutcome {
    /// Admitted; propose to consensus.
    Proceed,
    /// Rejected by the application hook with this result code.
    Reject(i32),
    /// The identity is already durably applied; reply idempotently.
    Duplicate(AppliedRecord),
}

/// The write-prep gate.
///
/// Evaluations may run concurrently across client identities; the caller
/// serializes evaluations for one identity.
pub struct WritePrepGate {
    engine: Arc<dyn StorageEngine>,
    registry: Arc<SchemaRegistry>,
    /// Qualified partition holding the sequence tracker's records.
    tracker_partition: String,
}

impl WritePrepGate {
    pub fn new(
        engine: Arc<dyn StorageEngine>,
        registry: Arc<SchemaRegistry>,
        tracker_partition: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            registry,
            tracker_partition: tracker_partition.into(),
        }
    }

    /// Evaluate a command for admission.
    pub fn evaluate(
        &self,
        id: &CommandId,
        payload: &[u8],
        sm: &dyn StateMachine,
    ) -> StrataResult<WritePrepOutcome> {
        // Durable-state duplicate check first, so replays never reach the
        // application hook or the log.
        if let Some(record) =
            sequence::durable_record(self.engine.as_ref(), &self.tracker_partition, &id.client)?
        {
            if id.sequence <= record.sequence {
                tracing::debug!(id = %id, "write-prep: replay of applied command");
                return Ok(WritePrepOutcome::Duplicate(record));
            }
        }

        let view = StorageView::new(self.engine.as_ref(), self.registry.as_ref());
        match sm.write_prep(id, payload, &view) {
            WritePrepDisposition::Proceed => Ok(WritePrepOutcome::Proceed),
            WritePrepDisposition::Reject(code) => {
                tracing::debug!(id = %id, code, "write-prep: rejected by application hook");
                Ok(WritePrepOutcome::Reject(code))
            }
        }
    }
}
