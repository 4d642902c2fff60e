//! Coordinator: wiring and lifecycle.
//!
//! Subscribes to committed commands from the replication driver and drives
//! sequence check → apply → atomic commit → reply dispatch on a single apply
//! thread; serves reads through the snapshot read manager and the
//! application's read hook. Owns no business logic itself.
//!
//! Start order: registry finalization → engine partitions → apply thread →
//! driver attach. Shutdown order: driver detach (channel close) → apply
//! thread drain → stopped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};

use crate::core::config::Config;
use crate::core::error::{StrataError, StrataResult};
use crate::engine::StorageEngine;
use crate::rsm::apply::{ApplyPipeline, CommittedCommand};
use crate::rsm::ident::CommandId;
use crate::rsm::sequence::SequenceTracker;
use crate::rsm::snapshot::{SnapshotReadManager, SnapshotView};
use crate::rsm::write_prep::{WritePrepGate, WritePrepOutcome};
use crate::rsm::{StateMachine, WriteReply, WriteStatus};
use crate::schema::registry::{
    Layer, PartitionDescriptor, SchemaRegistry, INTERNAL_DEFAULT_PARTITION,
};

/// Coordinator health, observable through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Starting,
    Serving,
    Stopping,
    Stopped,
    /// The apply pipeline hit a fatal engine failure; the process must
    /// restart and replay the log.
    Failed,
}

enum ApplyMsg {
    Command(CommittedCommand),
    Shutdown,
}

/// A command handed to the replication driver for proposal.
#[derive(Debug, Clone)]
pub struct ProposedCommand {
    pub id: CommandId,
    pub payload: Bytes,
}

/// Sink through which the consensus collaborator delivers committed
/// commands, strictly in commit order, one at a time. The channel is
/// bounded: a slow apply pipeline backpressures commit delivery.
#[derive(Clone)]
pub struct CommitSink {
    tx: mpsc::Sender<ApplyMsg>,
}

impl CommitSink {
    /// Deliver one committed command. Blocks while the apply queue is full.
    pub fn commit(&self, command: CommittedCommand) -> StrataResult<()> {
        self.tx
            .blocking_send(ApplyMsg::Command(command))
            .map_err(|_| StrataError::NotServing {
                state: "apply pipeline stopped".to_string(),
            })
    }
}

/// The consensus collaborator seam.
///
/// `attach` is called once during coordinator startup with the sink the
/// driver must feed committed commands into. `propose` submits a command
/// for replication and fails with `NotLeader` when this instance cannot
/// accept writes.
pub trait ReplicationDriver: Send + Sync {
    fn attach(&self, sink: CommitSink);
    fn propose(&self, command: ProposedCommand) -> StrataResult<()>;
}

/// Replication driver for a single-member consensus group: always leader,
/// commits every proposal immediately with the next commit index.
pub struct SoloDriver {
    /// Index assignment and delivery stay under one lock so concurrent
    /// proposers cannot deliver out of commit-index order.
    inner: Mutex<SoloInner>,
    leader: AtomicBool,
}

struct SoloInner {
    sink: Option<CommitSink>,
    next_index: u64,
}

impl SoloDriver {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SoloInner {
                sink: None,
                next_index: 0,
            }),
            leader: AtomicBool::new(true),
        }
    }

    /// Pretend to lose or regain leadership. Proposals while not leader
    /// fail with `NotLeader`.
    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::Release);
    }
}

impl Default for SoloDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicationDriver for SoloDriver {
    fn attach(&self, sink: CommitSink) {
        self.inner.lock().sink = Some(sink);
    }

    fn propose(&self, command: ProposedCommand) -> StrataResult<()> {
        if !self.leader.load(Ordering::Acquire) {
            return Err(StrataError::NotLeader);
        }
        let mut inner = self.inner.lock();
        let sink = inner.sink.clone().ok_or_else(|| StrataError::NotServing {
            state: "driver not attached".to_string(),
        })?;
        inner.next_index += 1;
        let commit_index = inner.next_index;
        sink.commit(CommittedCommand {
            id: command.id,
            payload: command.payload,
            commit_index,
        })
    }
}

/// In-flight write replies, keyed by command identity.
///
/// `poisoned` flips when the apply thread stops fatally; inserts after that
/// point would never be drained again, so they are refused under the same
/// lock that drains the map.
#[derive(Default)]
struct PendingMap {
    replies: HashMap<CommandId, oneshot::Sender<StrataResult<WriteReply>>>,
    poisoned: bool,
}

type PendingReplies = Arc<Mutex<PendingMap>>;

/// The pipeline coordinator.
pub struct Coordinator {
    group_id: String,
    instance_id: String,
    registry: Arc<SchemaRegistry>,
    engine: Arc<dyn StorageEngine>,
    sm: Arc<dyn StateMachine>,
    driver: Arc<dyn ReplicationDriver>,
    gate: WritePrepGate,
    snapshots: SnapshotReadManager,
    pending: PendingReplies,
    health_tx: Arc<watch::Sender<Health>>,
    shutdown_tx: mpsc::Sender<ApplyMsg>,
    apply_thread: Option<std::thread::JoinHandle<()>>,
}

impl Coordinator {
    /// Bring the whole pipeline up against one consensus group and instance
    /// identity.
    ///
    /// `app_partitions` are created in the application layer alongside the
    /// internally required ones; names the caller already registered (for
    /// custom configuration) are kept as registered. The registry freezes
    /// here: the serving phase observes an immutable table.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        config: &Config,
        group_id: impl Into<String>,
        instance_id: impl Into<String>,
        mut registry: SchemaRegistry,
        app_partitions: &[&str],
        engine: Arc<dyn StorageEngine>,
        sm: Arc<dyn StateMachine>,
        driver: Arc<dyn ReplicationDriver>,
    ) -> StrataResult<Self> {
        let group_id = group_id.into();
        let instance_id = instance_id.into();
        config
            .validate()
            .map_err(|e| StrataError::invalid(e.to_string()))?;

        if registry
            .lookup(Layer::Internal, INTERNAL_DEFAULT_PARTITION)
            .is_none()
        {
            registry.register(
                Layer::Internal,
                PartitionDescriptor::new(Layer::Internal, INTERNAL_DEFAULT_PARTITION)
                    .with_description("consensus log entries and metadata"),
            )?;
        }
        for &name in app_partitions {
            if registry.lookup(Layer::Application, name).is_some() {
                tracing::debug!(name, "application partition already registered; keeping");
                continue;
            }
            registry.register(
                Layer::Application,
                PartitionDescriptor::new(Layer::Application, name),
            )?;
        }
        registry.freeze();
        let registry = Arc::new(registry);

        for descriptor in registry.descriptors() {
            engine.open_partition(descriptor)?;
        }

        let tracker_descriptor = registry
            .lookup(Layer::Internal, INTERNAL_DEFAULT_PARTITION)
            .expect("internal default partition registered above");
        let tracker_partition = format!(
            "{}{}",
            tracker_descriptor.namespace_prefix, tracker_descriptor.name
        );

        let gate = WritePrepGate::new(
            Arc::clone(&engine),
            Arc::clone(&registry),
            &tracker_partition,
        );
        let snapshots = SnapshotReadManager::new(
            Arc::clone(&engine),
            Arc::clone(&registry),
            config.snapshots.max_pinned,
        );

        let (tx, rx) = mpsc::channel(config.apply.commit_queue_depth);
        // send_replace below: plain send() refuses to update the value once
        // no receiver is subscribed, and subscribers are optional here.
        let (health_tx, _) = watch::channel(Health::Starting);
        let health_tx = Arc::new(health_tx);
        let pending: PendingReplies = Arc::new(Mutex::new(PendingMap::default()));

        let pipeline = ApplyPipeline::new(
            Arc::clone(&engine),
            Arc::clone(&registry),
            SequenceTracker::new(Arc::clone(&engine), &tracker_partition),
            config.durability.sync_writes,
        );
        let apply_thread = spawn_apply_thread(
            rx,
            pipeline,
            Arc::clone(&sm),
            Arc::clone(&pending),
            Arc::clone(&health_tx),
        );

        driver.attach(CommitSink { tx: tx.clone() });
        health_tx.send_replace(Health::Serving);
        tracing::info!(group = %group_id, instance = %instance_id, "coordinator serving");

        Ok(Self {
            group_id,
            instance_id,
            registry,
            engine,
            sm,
            driver,
            gate,
            snapshots,
            pending,
            health_tx,
            shutdown_tx: tx,
            apply_thread: Some(apply_thread),
        })
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<dyn StorageEngine> {
        &self.engine
    }

    /// Current health.
    pub fn health(&self) -> Health {
        *self.health_tx.borrow()
    }

    /// Watch channel for health transitions.
    pub fn health_watch(&self) -> watch::Receiver<Health> {
        self.health_tx.subscribe()
    }

    /// The snapshot read manager, for callers holding a view across several
    /// reads.
    pub fn snapshots(&self) -> &SnapshotReadManager {
        &self.snapshots
    }

    fn ensure_serving(&self) -> StrataResult<()> {
        match self.health() {
            Health::Serving => Ok(()),
            other => Err(StrataError::NotServing {
                state: format!("{other:?}"),
            }),
        }
    }

    /// Submit one write command and block until its reply.
    ///
    /// Evaluations for the same client identity must be serialized by the
    /// caller; concurrent submissions for one identity are refused.
    pub fn submit(&self, id: CommandId, payload: Bytes) -> StrataResult<WriteReply> {
        self.ensure_serving()?;

        match self.gate.evaluate(&id, &payload, self.sm.as_ref())? {
            WritePrepOutcome::Duplicate(record) => Ok(WriteReply {
                code: record.result_code,
                status: WriteStatus::Duplicate,
            }),
            WritePrepOutcome::Reject(code) => Ok(WriteReply {
                code,
                status: WriteStatus::Rejected,
            }),
            WritePrepOutcome::Proceed => {
                let (reply_tx, reply_rx) = oneshot::channel();
                {
                    let mut pending = self.pending.lock();
                    if pending.poisoned {
                        return Err(StrataError::fatal("apply pipeline stopped"));
                    }
                    if pending.replies.contains_key(&id) {
                        return Err(StrataError::invalid(format!(
                            "concurrent submission for identity {id}"
                        )));
                    }
                    pending.replies.insert(id, reply_tx);
                }

                if let Err(e) = self.driver.propose(ProposedCommand { id, payload }) {
                    self.pending.lock().replies.remove(&id);
                    return Err(e);
                }

                reply_rx
                    .blocking_recv()
                    .map_err(|_| StrataError::NotServing {
                        state: "apply pipeline stopped".to_string(),
                    })?
            }
        }
    }

    /// Serve one read against a fresh view of the current durable state.
    pub fn read(
        &self,
        id: &CommandId,
        request: &[u8],
        reply_buf: &mut [u8],
    ) -> StrataResult<usize> {
        self.read_at(None, id, request, reply_buf).map(|(n, _)| n)
    }

    /// Serve one read pinned at `sequence` (or the current durable sequence
    /// number if `None`). Returns the bytes written and the resolved
    /// sequence number for follow-up reads wanting the same view.
    pub fn read_at(
        &self,
        sequence: Option<u64>,
        id: &CommandId,
        request: &[u8],
        reply_buf: &mut [u8],
    ) -> StrataResult<(usize, u64)> {
        self.ensure_serving()?;
        let (view, resolved) = self.snapshots.acquire(sequence)?;
        let result = self.read_with_view(&view, id, request, reply_buf);
        self.snapshots.release(resolved)?;
        result.map(|n| (n, resolved))
    }

    fn read_with_view(
        &self,
        view: &SnapshotView,
        id: &CommandId,
        request: &[u8],
        reply_buf: &mut [u8],
    ) -> StrataResult<usize> {
        self.sm.read(id, request, view, reply_buf)
    }

    /// Drain and shut the pipeline down. Idempotent. A `Failed` pipeline
    /// stays `Failed`; the process must restart and replay the log.
    pub fn stop(&mut self) {
        let Some(handle) = self.apply_thread.take() else {
            return;
        };
        let failed = matches!(self.health(), Health::Failed);
        if !failed {
            self.health_tx.send_replace(Health::Stopping);
        }
        let _ = self.shutdown_tx.blocking_send(ApplyMsg::Shutdown);
        let _ = handle.join();
        if !failed {
            self.health_tx.send_replace(Health::Stopped);
        }
        tracing::info!(group = %self.group_id, instance = %self.instance_id, "coordinator stopped");
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_apply_thread(
    mut rx: mpsc::Receiver<ApplyMsg>,
    mut pipeline: ApplyPipeline,
    sm: Arc<dyn StateMachine>,
    pending: PendingReplies,
    health_tx: Arc<watch::Sender<Health>>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("strata-apply".to_string())
        .spawn(move || {
            while let Some(msg) = rx.blocking_recv() {
                let command = match msg {
                    ApplyMsg::Shutdown => break,
                    ApplyMsg::Command(command) => command,
                };

                match pipeline.apply(sm.as_ref(), &command) {
                    Ok(reply) => {
                        if let Some(tx) = pending.lock().replies.remove(&command.id) {
                            let _ = tx.send(Ok(reply));
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "apply pipeline failed; stopping");
                        health_tx.send_replace(Health::Failed);
                        // Poison under the same lock as the drain: a submit
                        // racing this drain either lands before it (and is
                        // failed here) or observes the poison and fails fast.
                        let mut pending = pending.lock();
                        pending.poisoned = true;
                        if let Some(tx) = pending.replies.remove(&command.id) {
                            let _ = tx.send(Err(StrataError::fatal(e.to_string())));
                        }
                        for (_, tx) in pending.replies.drain() {
                            let _ = tx.send(Err(StrataError::fatal("apply pipeline stopped")));
                        }
                        break;
                    }
                }
            }
        })
        .expect("failed to spawn apply thread")
}
