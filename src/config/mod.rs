//! Configuration models for the allocator and its targets.

pub mod allocator;

pub use allocator::{AllocatorConfig, LabConfig, TargetConfig, ENV_PREFIX};
