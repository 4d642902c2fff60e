//! Error types for the replication layer.
//!
//! The taxonomy separates recoverable request-level conditions (admission
//! rejects, application apply errors) from startup configuration errors and
//! from the one fatal category: a failed atomic commit to the storage engine,
//! after which consensus/storage consistency can no longer be guaranteed.

use thiserror::Error;

use crate::schema::registry::Layer;

/// Schema registry errors.
///
/// All of these are startup-phase configuration errors: registration is
/// frozen before the serving phase begins, so none of them can occur while
/// commands are being applied.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A descriptor with the same name already exists in the layer.
    #[error("partition '{name}' already registered in layer {layer:?}")]
    Duplicate { layer: Layer, name: String },

    /// The layer's partition table is full.
    #[error("partition table for layer {layer:?} is full (max {capacity})")]
    CapacityExceeded { layer: Layer, capacity: usize },

    /// The descriptor name is empty or exceeds the maximum length.
    #[error("invalid partition descriptor: {reason}")]
    InvalidDescriptor { reason: String },

    /// No descriptor with the given name exists in the layer.
    #[error("partition '{name}' not found in layer {layer:?}")]
    NotFound { layer: Layer, name: String },

    /// The registry has been frozen; no further mutation is permitted.
    #[error("registry is frozen; registration must complete before serving")]
    Frozen,
}

/// Storage engine errors surfaced through the engine contract.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The named partition has not been opened on this engine.
    #[error("partition '{name}' is not open")]
    PartitionNotFound { name: String },

    /// No snapshot is pinned at the requested sequence number.
    #[error("no pinned snapshot at sequence {sequence}")]
    SnapshotNotFound { sequence: u64 },

    /// I/O-level failure inside the engine.
    #[error("engine i/o failure: {message}")]
    Io { message: String },
}

/// Top-level error type for the replication layer.
#[derive(Debug, Error)]
pub enum StrataError {
    /// The replication driver is not the leader for the group; the client
    /// should retry against the current leader.
    #[error("not the leader for this consensus group")]
    NotLeader,

    /// Schema registry error (startup phase only).
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Recoverable engine error on a read path.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// An atomic batch commit failed. The apply pipeline has stopped; the
    /// process must restart and replay the log to recover.
    #[error("fatal engine failure during atomic commit: {message}")]
    EngineFatal { message: String },

    /// Snapshot handle released without a matching acquire, or twice.
    #[error("snapshot release without matching acquire at sequence {sequence}")]
    SnapshotMisuse { sequence: u64 },

    /// The coordinator is not running (never started, stopped, or failed).
    #[error("coordinator is not serving: {state}")]
    NotServing { state: String },

    /// Malformed request (e.g. reply buffer too small for the read result).
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
}

impl StrataError {
    /// Fatal errors require a process restart with log replay.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::EngineFatal { .. })
    }

    /// Whether a well-behaved client may safely retry the same command
    /// (same identity, same sequence number) elsewhere or later.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::NotLeader | Self::NotServing { .. })
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::EngineFatal {
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }
}

/// Result type using StrataError.
pub type StrataResult<T> = Result<T, StrataError>;
