//! Namespace and schema registry.

pub mod registry;
