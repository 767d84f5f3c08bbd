//! Builders to construct allocator components from configuration.

pub mod registry_builder;

pub use registry_builder::{build_allocator, build_registry};
