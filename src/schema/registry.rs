//! Layered partition descriptor registry.
//!
//! The registry partitions one storage engine into independently configured
//! namespaces (partitions), grouped into ordered layers so consensus-internal
//! metadata and application data cannot collide. All registration happens
//! during startup, before the serving phase; [`SchemaRegistry::freeze`] marks
//! the transition, after which the table is immutable and may be shared
//! across threads without locking.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::error::RegistryError;

/// Maximum number of partition descriptors per layer.
pub const MAX_PARTITIONS_PER_LAYER: usize = 32;

/// Maximum partition name length in bytes.
pub const MAX_PARTITION_NAME_LEN: usize = 4096;

/// Well-known name of the internal layer's default partition. Holds the
/// consensus collaborator's metadata and the sequence tracker's bookkeeping.
pub const INTERNAL_DEFAULT_PARTITION: &str = "default";

/// Namespace prefix for internal-layer partitions.
pub const INTERNAL_NAMESPACE_PREFIX: &str = "sys:";

/// Namespace prefix for application-layer partitions.
pub const APPLICATION_NAMESPACE_PREFIX: &str = "app:";

/// Ordered storage layer. Lower layers are owned by the replication
/// machinery; higher layers belong to the application.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Layer {
    /// Consensus-internal metadata and replication bookkeeping.
    Internal = 0,
    /// Application key-value data.
    Application = 1,
}

impl Layer {
    /// All layers, in order. Engine startup opens partitions layer by layer.
    pub const ALL: [Layer; 2] = [Layer::Internal, Layer::Application];

    /// Default namespace prefix for descriptors registered in this layer.
    pub fn namespace_prefix(self) -> &'static str {
        match self {
            Layer::Internal => INTERNAL_NAMESPACE_PREFIX,
            Layer::Application => APPLICATION_NAMESPACE_PREFIX,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Engine-level tuning produced by a descriptor's config function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Write buffer size hint in bytes.
    pub write_buffer_bytes: usize,
    /// Block cache size hint in bytes.
    pub block_cache_bytes: usize,
    /// Whether values are compressed at rest.
    pub compression: bool,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            write_buffer_bytes: 4 * 1024 * 1024,
            block_cache_bytes: 8 * 1024 * 1024,
            compression: true,
        }
    }
}

/// Configuration-producing function attached to a descriptor.
///
/// Evaluated once per partition when the engine opens it at startup; a
/// function rather than a value so overrides can be swapped in before the
/// registry freezes without eagerly building engine options.
pub type ConfigFn = Arc<dyn Fn() -> PartitionConfig + Send + Sync>;

/// A partition descriptor: one named, versioned subdivision of the engine's
/// keyspace within a layer.
#[derive(Clone)]
pub struct PartitionDescriptor {
    /// Partition name, unique within its layer.
    pub name: String,
    /// Owning layer.
    pub layer: Layer,
    /// Namespace prefix isolating this partition's keys.
    pub namespace_prefix: String,
    /// Produces the engine configuration for this partition.
    pub config_fn: ConfigFn,
    /// Schema version, checked at startup for evolution detection.
    pub version: u32,
    /// Higher layers may read but never write this partition.
    pub read_only_to_upper_layers: bool,
    /// Free-text description.
    pub description: String,
}

impl PartitionDescriptor {
    /// Create a descriptor with the layer's default prefix, version 1, and
    /// default engine configuration.
    pub fn new(layer: Layer, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            layer,
            namespace_prefix: layer.namespace_prefix().to_string(),
            config_fn: Arc::new(PartitionConfig::default),
            version: 1,
            read_only_to_upper_layers: layer == Layer::Internal,
            description: String::new(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.namespace_prefix = prefix.into();
        self
    }

    pub fn with_config(mut self, config_fn: ConfigFn) -> Self {
        self.config_fn = config_fn;
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Evaluate the config function.
    pub fn config(&self) -> PartitionConfig {
        (self.config_fn)()
    }
}

impl fmt::Debug for PartitionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionDescriptor")
            .field("name", &self.name)
            .field("layer", &self.layer)
            .field("namespace_prefix", &self.namespace_prefix)
            .field("version", &self.version)
            .field("read_only_to_upper_layers", &self.read_only_to_upper_layers)
            .field("description", &self.description)
            .finish()
    }
}

/// Per-layer partition descriptor registry.
///
/// Populated by explicit calls during the registration phase and frozen
/// before serving begins. Lookups are linear scans; registration-time entry
/// counts are small and fixed.
pub struct SchemaRegistry {
    layers: [Vec<PartitionDescriptor>; Layer::ALL.len()],
    frozen: bool,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self {
            layers: [Vec::new(), Vec::new()],
            frozen: false,
        }
    }

    /// Register a descriptor in the given layer.
    ///
    /// The descriptor's own layer tag is overwritten with `layer`.
    pub fn register(
        &mut self,
        layer: Layer,
        mut descriptor: PartitionDescriptor,
    ) -> Result<(), RegistryError> {
        if self.frozen {
            return Err(RegistryError::Frozen);
        }
        if descriptor.name.is_empty() || descriptor.name.len() > MAX_PARTITION_NAME_LEN {
            return Err(RegistryError::InvalidDescriptor {
                reason: format!(
                    "name length {} outside 1..={}",
                    descriptor.name.len(),
                    MAX_PARTITION_NAME_LEN
                ),
            });
        }

        let table = &mut self.layers[layer.index()];
        if table.iter().any(|d| d.name == descriptor.name) {
            return Err(RegistryError::Duplicate {
                layer,
                name: descriptor.name,
            });
        }
        if table.len() >= MAX_PARTITIONS_PER_LAYER {
            return Err(RegistryError::CapacityExceeded {
                layer,
                capacity: MAX_PARTITIONS_PER_LAYER,
            });
        }

        descriptor.layer = layer;
        tracing::info!(
            layer = ?layer,
            name = %descriptor.name,
            version = descriptor.version,
            "registered partition descriptor"
        );
        table.push(descriptor);
        Ok(())
    }

    /// Look up a descriptor by name within a layer.
    pub fn lookup(&self, layer: Layer, name: &str) -> Option<&PartitionDescriptor> {
        self.layers[layer.index()].iter().find(|d| d.name == name)
    }

    /// Number of descriptors registered in a layer.
    pub fn count(&self, layer: Layer) -> usize {
        self.layers[layer.index()].len()
    }

    /// Get a descriptor by registration index within a layer.
    pub fn get(&self, layer: Layer, index: usize) -> Option<&PartitionDescriptor> {
        self.layers[layer.index()].get(index)
    }

    /// Iterate all descriptors, internal layer first. Used at startup to
    /// open one engine partition per descriptor.
    pub fn descriptors(&self) -> impl Iterator<Item = &PartitionDescriptor> {
        self.layers.iter().flatten()
    }

    /// Replace only the configuration producer of an existing descriptor.
    ///
    /// If the descriptor does not exist and it is the internal layer's
    /// well-known default partition, it is auto-created with the override
    /// configuration attached; a higher layer can thus customize the lowest
    /// layer's default partition without it being pre-declared. Any other
    /// unregistered name fails with `NotFound`.
    pub fn override_config(
        &mut self,
        layer: Layer,
        name: &str,
        new_config_fn: ConfigFn,
    ) -> Result<(), RegistryError> {
        if self.frozen {
            return Err(RegistryError::Frozen);
        }

        if let Some(descriptor) = self.layers[layer.index()]
            .iter_mut()
            .find(|d| d.name == name)
        {
            descriptor.config_fn = new_config_fn;
            tracing::warn!(layer = ?layer, name = %name, "overrode partition config");
            return Ok(());
        }

        if layer == Layer::Internal && name == INTERNAL_DEFAULT_PARTITION {
            tracing::warn!(
                name = %name,
                "default partition not registered; auto-registering with override config"
            );
            let descriptor = PartitionDescriptor::new(layer, name)
                .with_config(new_config_fn)
                .with_description("consensus log entries and metadata (overridden)");
            return self.register(layer, descriptor);
        }

        Err(RegistryError::NotFound {
            layer,
            name: name.to_string(),
        })
    }

    /// Freeze the registry, ending the registration phase.
    pub fn freeze(&mut self) {
        self.frozen = true;
        tracing::info!(
            internal = self.count(Layer::Internal),
            application = self.count(Layer::Application),
            "schema registry frozen"
        );
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}
