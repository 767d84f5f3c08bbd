//! Builders to construct the target registry and allocator from configuration.

use std::sync::Arc;

use crate::config::{LabConfig, TargetConfig};
use crate::core::{AllocResult, Allocator, AllocatorError, Target, TargetRegistry};

/// Build the target registry from lab configuration.
///
/// `decorate` is called once per target to attach the collaborators the
/// embedding daemon provides (assign and release hooks, power control).
pub fn build_registry<F>(cfg: &LabConfig, mut decorate: F) -> AllocResult<TargetRegistry>
where
    F: FnMut(&str, &TargetConfig, Target) -> AllocResult<Target>,
{
    cfg.validate()
        .map_err(|e| AllocatorError::Config(format!("config invalid: {e}")))?;

    let allocator = &cfg.allocator;
    let mut registry = TargetRegistry::new();
    for (name, target_cfg) in &cfg.targets {
        let target = Target::open(
            name.clone(),
            allocator.target_path(name),
            allocator.lock_timeout(),
            allocator.lock_wait(),
            target_cfg.properties(),
        )?;
        registry.insert(decorate(name, target_cfg, target)?)?;
    }
    tracing::debug!(targets = registry.len(), "target registry built");
    Ok(registry)
}

/// Build an allocator over every configured target.
pub fn build_allocator<F>(cfg: &LabConfig, decorate: F) -> AllocResult<Allocator>
where
    F: FnMut(&str, &TargetConfig, Target) -> AllocResult<Target>,
{
    let registry = build_registry(cfg, decorate)?;
    Allocator::new(cfg.allocator.clone(), Arc::new(registry))
}
