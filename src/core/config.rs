//! Configuration parsing and validation.
//!
//! Configuration is loaded from TOML files. Sections mirror the pipeline's
//! operational knobs: storage paths, commit durability, apply-queue depth,
//! and snapshot-cache bounds.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Filesystem paths.
    #[serde(default)]
    pub paths: PathConfig,

    /// Commit durability settings.
    #[serde(default)]
    pub durability: DurabilityConfig,

    /// Apply pipeline settings.
    #[serde(default)]
    pub apply: ApplyConfig,

    /// Snapshot read manager settings.
    #[serde(default)]
    pub snapshots: SnapshotConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            paths: PathConfig::default(),
            durability: DurabilityConfig::default(),
            apply: ApplyConfig::default(),
            snapshots: SnapshotConfig::default(),
        }
    }
}

/// Filesystem paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    /// Storage engine data directory.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> String {
    "data".to_string()
}

/// Commit durability settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurabilityConfig {
    /// Fsync every atomic batch commit. Disabling trades crash durability
    /// of the most recent commits for throughput.
    #[serde(default = "default_true")]
    pub sync_writes: bool,
}

impl Default for DurabilityConfig {
    fn default() -> Self {
        Self { sync_writes: true }
    }
}

fn default_true() -> bool {
    true
}

/// Apply pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyConfig {
    /// Bounded depth of the commit channel feeding the apply thread.
    /// A full channel backpressures the consensus collaborator.
    #[serde(default = "default_commit_queue_depth")]
    pub commit_queue_depth: usize,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            commit_queue_depth: default_commit_queue_depth(),
        }
    }
}

fn default_commit_queue_depth() -> usize {
    256
}

/// Snapshot read manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Maximum number of distinct pinned sequence numbers held open at once.
    #[serde(default = "default_max_pinned")]
    pub max_pinned: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            max_pinned: default_max_pinned(),
        }
    }
}

fn default_max_pinned() -> usize {
    64
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.paths.data_dir.is_empty() {
            anyhow::bail!("paths.data_dir must not be empty");
        }
        if self.apply.commit_queue_depth == 0 {
            anyhow::bail!("apply.commit_queue_depth must be at least 1");
        }
        if self.snapshots.max_pinned == 0 {
            anyhow::bail!("snapshots.max_pinned must be at least 1");
        }
        Ok(())
    }
}
