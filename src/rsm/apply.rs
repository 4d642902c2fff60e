//! Commit-order apply pipeline.
//!
//! Runs once per committed command, single-threaded with respect to itself,
//! in the order commands committed: `Received → Deduped? → {Skip | Invoke} →
//! Staged → Committed`. Duplicates skip the application handler but still
//! produce the reply the original caller expects. All staged writes plus the
//! sequence tracker's bookkeeping commit as one atomic batch; a failed
//! handler discards the batch without advancing the tracker, and a failed
//! engine commit is fatal to the pipeline.

use std::any::Any;
use std::sync::Arc;

use bytes::Bytes;

use crate::core::error::{StrataError, StrataResult};
use crate::engine::{StorageEngine, WriteBatch};
use crate::rsm::ident::CommandId;
use crate::rsm::sequence::{SequenceCheck, SequenceTracker};
use crate::rsm::{resolve_partition, StateMachine, WriteReply, WriteStatus};
use crate::schema::registry::SchemaRegistry;

/// A committed command delivered by the consensus collaborator, strictly in
/// commit order.
#[derive(Debug, Clone)]
pub struct CommittedCommand {
    pub id: CommandId,
    pub payload: Bytes,
    /// Strictly increasing consensus commit index.
    pub commit_index: u64,
}

/// Opaque owner handle returned to a completion callback.
pub type OwnerToken = Box<dyn Any + Send>;

/// Post-commit completion notification for one staged write. Invoked only
/// after the batch durably commits, with the owner token it was staged with.
pub type CompletionFn = Box<dyn FnOnce(OwnerToken) + Send>;

/// Transient per-commit capability for staging writes into the in-progress
/// atomic batch.
///
/// Valid only for the dynamic extent of one apply call; the borrow makes it
/// impossible to retain across commits.
pub struct ApplyContext<'a> {
    id: &'a CommandId,
    engine: &'a dyn StorageEngine,
    registry: &'a SchemaRegistry,
    batch: &'a mut WriteBatch,
    completions: &'a mut Vec<(CompletionFn, OwnerToken)>,
}

impl<'a> ApplyContext<'a> {
    /// Identity of the command being applied.
    pub fn command_id(&self) -> &CommandId {
        self.id
    }

    /// Stage one key-value write into the atomic batch.
    pub fn stage_kv(&mut self, partition: &str, key: Vec<u8>, value: Vec<u8>) -> StrataResult<()> {
        let qualified = resolve_partition(self.registry, partition, true)?;
        self.batch.put(qualified, key, value);
        Ok(())
    }

    /// Stage one key-value write with a completion notification, delivered
    /// with `token` after the batch durably commits.
    pub fn stage_kv_notify(
        &mut self,
        partition: &str,
        key: Vec<u8>,
        value: Vec<u8>,
        completion: CompletionFn,
        token: OwnerToken,
    ) -> StrataResult<()> {
        self.stage_kv(partition, key, value)?;
        self.completions.push((completion, token));
        Ok(())
    }

    /// Point lookup against the latest durable state. Staged writes of the
    /// current batch are not visible.
    pub fn get(&self, partition: &str, key: &[u8]) -> StrataResult<Option<Vec<u8>>> {
        let qualified = resolve_partition(self.registry, partition, false)?;
        Ok(self.engine.get(&qualified, key)?)
    }

    /// Number of writes staged so far, including by earlier calls.
    pub fn staged(&self) -> usize {
        self.batch.len()
    }
}

/// The apply pipeline. One instance, owned by the apply thread.
pub struct ApplyPipeline {
    engine: Arc<dyn StorageEngine>,
    registry: Arc<SchemaRegistry>,
    tracker: SequenceTracker,
    sync_writes: bool,
    last_commit_index: u64,
}

impl ApplyPipeline {
    pub fn new(
        engine: Arc<dyn StorageEngine>,
        registry: Arc<SchemaRegistry>,
        tracker: SequenceTracker,
        sync_writes: bool,
    ) -> Self {
        Self {
            engine,
            registry,
            tracker,
            sync_writes,
            last_commit_index: 0,
        }
    }

    /// Process one committed command.
    ///
    /// Returns the client reply, or `EngineFatal` if the atomic commit
    /// itself failed, after which the pipeline must not process further
    /// commands.
    pub fn apply(
        &mut self,
        sm: &dyn StateMachine,
        command: &CommittedCommand,
    ) -> StrataResult<WriteReply> {
        debug_assert!(
            command.commit_index > self.last_commit_index,
            "commit order violation: {} <= {}",
            command.commit_index,
            self.last_commit_index
        );
        self.last_commit_index = command.commit_index;

        match self.tracker.check_and_would_apply(&command.id)? {
            SequenceCheck::Duplicate(record) => {
                tracing::debug!(
                    id = %command.id,
                    applied_seq = record.sequence,
                    "skipping duplicate command"
                );
                Ok(WriteReply {
                    code: record.result_code,
                    status: WriteStatus::Duplicate,
                })
            }
            SequenceCheck::Apply => self.invoke(sm, command),
        }
    }

    fn invoke(
        &mut self,
        sm: &dyn StateMachine,
        command: &CommittedCommand,
    ) -> StrataResult<WriteReply> {
        let mut batch = WriteBatch::new();
        let mut completions: Vec<(CompletionFn, OwnerToken)> = Vec::new();

        let handler_result = {
            let mut ctx = ApplyContext {
                id: &command.id,
                engine: self.engine.as_ref(),
                registry: self.registry.as_ref(),
                batch: &mut batch,
                completions: &mut completions,
            };
            sm.apply(&command.id, &command.payload, &mut ctx)
        };

        let code = match handler_result {
            Ok(code) => code,
            Err(code) => {
                // Discard everything staged; the tracker does not advance,
                // so a client retry of this sequence number is re-applied.
                tracing::warn!(id = %command.id, code, "apply handler failed; batch discarded");
                return Ok(WriteReply {
                    code,
                    status: WriteStatus::ApplyFailed,
                });
            }
        };

        self.tracker
            .record(&command.id, command.commit_index, code, &mut batch);

        let staged = batch.len();
        match self.engine.commit_batch(batch, self.sync_writes) {
            Ok(sequence) => {
                self.tracker
                    .mark_applied(&command.id, command.commit_index, code);
                tracing::debug!(
                    id = %command.id,
                    commit_index = command.commit_index,
                    sequence,
                    staged,
                    "committed apply batch"
                );
                for (completion, token) in completions {
                    completion(token);
                }
                Ok(WriteReply {
                    code,
                    status: WriteStatus::Applied,
                })
            }
            Err(e) => {
                // Consensus says committed but storage did not apply; the
                // only safe path is restart with recovery replay.
                tracing::error!(id = %command.id, error = %e, "atomic commit failed");
                Err(StrataError::fatal(format!(
                    "atomic commit failed for {}: {e}",
                    command.id
                )))
            }
        }
    }
}
