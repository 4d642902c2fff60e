//! In-memory storage engine.
//!
//! Version-chained per-partition maps with batch-atomic visibility: a commit
//! appends every staged write under one new sequence number while holding the
//! write lock, so readers either see the whole batch or none of it. Pinned
//! snapshots read the chains as of their sequence number without blocking
//! commits for longer than the map lookup.
//!
//! Used by the integration tests and for embedded bring-up; production
//! deployments supply a durable engine behind the same contract.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use super::{EngineResult, EngineSnapshot, StorageEngine, WriteBatch};
use crate::core::error::EngineError;
use crate::schema::registry::{PartitionConfig, PartitionDescriptor};

/// Value history for one key: (sequence, value) pairs in ascending sequence
/// order. Entries are never rewritten, only appended.
type VersionChain = Vec<(u64, Vec<u8>)>;

struct Partition {
    config: PartitionConfig,
    map: BTreeMap<Vec<u8>, VersionChain>,
}

struct Inner {
    partitions: HashMap<String, Partition>,
    /// Durable sequence number; advances once per committed batch.
    sequence: u64,
    /// Live pinned-view resources, by sequence number.
    pinned: HashMap<u64, usize>,
    /// Test hook: fail the next commits with an I/O error.
    fail_commits: bool,
}

/// In-memory engine implementing the [`StorageEngine`] contract.
pub struct MemoryEngine {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                partitions: HashMap::new(),
                sequence: 0,
                pinned: HashMap::new(),
                fail_commits: false,
            })),
        }
    }

    /// Make every subsequent `commit_batch` fail with an I/O error.
    /// Exercises the fatal apply-pipeline path in tests.
    pub fn fail_commits(&self, fail: bool) {
        self.inner.write().fail_commits = fail;
    }

    /// Number of distinct pinned-view resources currently alive.
    pub fn pinned_snapshot_count(&self) -> usize {
        self.inner.read().pinned.len()
    }

    /// Evaluated config a partition was opened with, if open.
    pub fn partition_config(&self, partition: &str) -> Option<PartitionConfig> {
        self.inner
            .read()
            .partitions
            .get(partition)
            .map(|p| p.config.clone())
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn value_at(chain: &VersionChain, sequence: u64) -> Option<Vec<u8>> {
    chain
        .iter()
        .rev()
        .find(|(seq, _)| *seq <= sequence)
        .map(|(_, value)| value.clone())
}

impl StorageEngine for MemoryEngine {
    fn open_partition(&self, descriptor: &PartitionDescriptor) -> EngineResult<()> {
        let qualified = format!("{}{}", descriptor.namespace_prefix, descriptor.name);
        let mut inner = self.inner.write();
        inner.partitions.entry(qualified).or_insert_with(|| Partition {
            config: descriptor.config(),
            map: BTreeMap::new(),
        });
        Ok(())
    }

    fn has_partition(&self, partition: &str) -> bool {
        self.inner.read().partitions.contains_key(partition)
    }

    fn get(&self, partition: &str, key: &[u8]) -> EngineResult<Option<Vec<u8>>> {
        let inner = self.inner.read();
        let part = inner
            .partitions
            .get(partition)
            .ok_or_else(|| EngineError::PartitionNotFound {
                name: partition.to_string(),
            })?;
        Ok(part
            .map
            .get(key)
            .and_then(|chain| value_at(chain, inner.sequence)))
    }

    fn commit_batch(&self, batch: WriteBatch, _sync: bool) -> EngineResult<u64> {
        let mut inner = self.inner.write();
        if inner.fail_commits {
            return Err(EngineError::Io {
                message: "injected commit failure".to_string(),
            });
        }

        // Validate every target partition before mutating anything, so a
        // bad batch leaves no partial state behind.
        for write in batch.writes() {
            if !inner.partitions.contains_key(&write.partition) {
                return Err(EngineError::PartitionNotFound {
                    name: write.partition.clone(),
                });
            }
        }

        let sequence = inner.sequence + 1;
        for write in batch.writes() {
            let part = inner
                .partitions
                .get_mut(&write.partition)
                .expect("partition validated above");
            let chain = part.map.entry(write.key.clone()).or_default();
            // Last write within the batch wins at the same sequence.
            if let Some(last) = chain.last_mut() {
                if last.0 == sequence {
                    last.1 = write.value.clone();
                    continue;
                }
            }
            chain.push((sequence, write.value.clone()));
        }
        inner.sequence = sequence;
        Ok(sequence)
    }

    fn current_sequence(&self) -> u64 {
        self.inner.read().sequence
    }

    fn pin_snapshot(&self, sequence: Option<u64>) -> EngineResult<Arc<dyn EngineSnapshot>> {
        let mut inner = self.inner.write();
        let sequence = sequence.unwrap_or(inner.sequence);
        *inner.pinned.entry(sequence).or_insert(0) += 1;
        Ok(Arc::new(MemorySnapshot {
            inner: Arc::clone(&self.inner),
            sequence,
        }))
    }

    fn unpin_snapshot(&self, sequence: u64) -> EngineResult<()> {
        let mut inner = self.inner.write();
        match inner.pinned.get_mut(&sequence) {
            Some(count) if *count > 1 => {
                *count -= 1;
                Ok(())
            }
            Some(_) => {
                inner.pinned.remove(&sequence);
                Ok(())
            }
            None => Err(EngineError::SnapshotNotFound { sequence }),
        }
    }
}

/// Read view over the version chains as of a fixed sequence number.
struct MemorySnapshot {
    inner: Arc<RwLock<Inner>>,
    sequence: u64,
}

impl EngineSnapshot for MemorySnapshot {
    fn sequence(&self) -> u64 {
        self.sequence
    }

    fn get(&self, partition: &str, key: &[u8]) -> EngineResult<Option<Vec<u8>>> {
        let inner = self.inner.read();
        let part = inner
            .partitions
            .get(partition)
            .ok_or_else(|| EngineError::PartitionNotFound {
                name: partition.to_string(),
            })?;
        Ok(part
            .map
            .get(key)
            .and_then(|chain| value_at(chain, self.sequence)))
    }
}
