//! Schema registry integration tests: registration drives engine startup.

mod common;

use std::sync::Arc;

use strata::schema::registry::{
    ConfigFn, APPLICATION_NAMESPACE_PREFIX, INTERNAL_DEFAULT_PARTITION,
};
use strata::{Layer, PartitionConfig, PartitionDescriptor, SchemaRegistry, StorageEngine};

use common::{start_cluster, start_cluster_with_registry};

// ============================================================================
// Startup registration
// ============================================================================

#[test]
fn startup_opens_one_engine_partition_per_descriptor() {
    let cluster = start_cluster(&["kv", "orders"]);

    assert!(cluster.engine.has_partition("sys:default"));
    assert!(cluster.engine.has_partition("app:kv"));
    assert!(cluster.engine.has_partition("app:orders"));
    assert!(!cluster.engine.has_partition("app:missing"));

    let registry = cluster.coordinator.registry();
    assert!(registry.is_frozen());
    assert_eq!(registry.count(Layer::Internal), 1);
    assert_eq!(registry.count(Layer::Application), 2);

    // Indexed enumeration matches what the engine was started with.
    for layer in Layer::ALL {
        for i in 0..registry.count(layer) {
            let descriptor = registry.get(layer, i).unwrap();
            let qualified = format!("{}{}", descriptor.namespace_prefix, descriptor.name);
            assert!(cluster.engine.has_partition(&qualified));
        }
        assert!(registry.get(layer, registry.count(layer)).is_none());
    }
}

#[test]
fn preregistered_descriptor_wins_over_startup_default() {
    let mut registry = SchemaRegistry::new();
    registry
        .register(
            Layer::Application,
            PartitionDescriptor::new(Layer::Application, "kv")
                .with_version(4)
                .with_config(Arc::new(|| PartitionConfig {
                    write_buffer_bytes: 1024,
                    block_cache_bytes: 2048,
                    compression: false,
                }))
                .with_description("custom tuned kv"),
        )
        .unwrap();

    let cluster = start_cluster_with_registry(&["kv"], registry);

    let descriptor = cluster
        .coordinator
        .registry()
        .lookup(Layer::Application, "kv")
        .unwrap();
    assert_eq!(descriptor.version, 4);
    assert_eq!(descriptor.namespace_prefix, APPLICATION_NAMESPACE_PREFIX);

    // The engine opened the partition with the custom config, not defaults.
    let opened = cluster.engine.partition_config("app:kv").unwrap();
    assert_eq!(opened.write_buffer_bytes, 1024);
    assert!(!opened.compression);
}

#[test]
fn internal_default_config_override_reaches_engine() {
    let mut registry = SchemaRegistry::new();
    let config: ConfigFn = Arc::new(|| PartitionConfig {
        write_buffer_bytes: 512,
        block_cache_bytes: 512,
        compression: false,
    });
    // Not pre-declared: auto-created with the override attached.
    registry
        .override_config(Layer::Internal, INTERNAL_DEFAULT_PARTITION, config)
        .unwrap();

    let cluster = start_cluster_with_registry(&["kv"], registry);

    let opened = cluster.engine.partition_config("sys:default").unwrap();
    assert_eq!(opened.write_buffer_bytes, 512);
}

#[test]
fn same_name_in_both_layers_is_distinct() {
    let mut registry = SchemaRegistry::new();
    registry
        .register(
            Layer::Internal,
            PartitionDescriptor::new(Layer::Internal, "meta"),
        )
        .unwrap();
    registry
        .register(
            Layer::Application,
            PartitionDescriptor::new(Layer::Application, "meta"),
        )
        .unwrap();

    let cluster = start_cluster_with_registry(&[], registry);

    assert!(cluster.engine.has_partition("sys:meta"));
    assert!(cluster.engine.has_partition("app:meta"));
}
