//! Strata - replicated-state-machine layer over an embedded key-value engine.
//!
//! Strata sits between a consensus log and an embedded storage engine,
//! turning a stream of agreed-upon, ordered commands into durable,
//! exactly-once key-value mutations, and serving point-in-time-consistent
//! reads against the same store. The consensus protocol, network transport,
//! and the engine's internals stay behind trait seams.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Client request threads                      │
//! │        write-prep gate (admission)   │   snapshot reads         │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Consensus collaborator                       │
//! │           propose → replicate → commit (in order)               │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 Apply pipeline (single thread)                  │
//! │   sequence check │ app apply hook │ atomic batch │ reply        │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Embedded storage engine                        │
//! │      layered partitions │ batches │ pinned snapshots            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::error`] - Error taxonomy
//!
//! ## Schema
//! - [`schema::registry`] - Layered partition descriptor registry
//!
//! ## Engine
//! - [`engine`] - Storage engine contract (batches, pinned snapshots)
//! - [`engine::memory`] - In-memory engine for tests and embedded bring-up
//!
//! ## RSM
//! - [`rsm::ident`] - Client-scoped command identity
//! - [`rsm::sequence`] - Exactly-once sequence tracking
//! - [`rsm::write_prep`] - Pre-replication admission gate
//! - [`rsm::apply`] - Commit-order apply pipeline
//! - [`rsm::snapshot`] - Reference-counted pinned read views
//! - [`rsm::coordinator`] - Wiring, lifecycle, replication driver seam
//!
//! # Key Invariants
//!
//! - **APPLY-ORDER**: committed commands apply on one thread, in commit
//!   order, never concurrently
//! - **EXACTLY-ONCE**: a sequence number at or below a client's last applied
//!   value is a duplicate and never re-runs apply logic
//! - **BATCH-ATOMIC**: staged writes and tracker bookkeeping become durable
//!   together or not at all
//! - **PIN-STABLE**: a pinned read view never observes writes committed
//!   after its sequence number

pub mod core;
pub mod engine;
pub mod rsm;
pub mod schema;

// Re-exports for convenience
pub use self::core::{config, config::Config, error, error::StrataError, error::StrataResult};
pub use engine::{memory::MemoryEngine, EngineSnapshot, StorageEngine, WriteBatch};
pub use rsm::{
    apply::{ApplyContext, CommittedCommand},
    coordinator::{Coordinator, Health, ReplicationDriver, SoloDriver},
    ident::{ClientId, CommandId},
    snapshot::SnapshotView,
    write_prep::WritePrepDisposition,
    StateMachine, StorageView, WriteReply, WriteStatus,
};
pub use schema::registry::{Layer, PartitionConfig, PartitionDescriptor, SchemaRegistry};
