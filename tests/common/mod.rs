//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempDir;

use lab_allocator::builders::build_allocator;
use lab_allocator::config::{AllocatorConfig, LabConfig, TargetConfig};
use lab_allocator::core::{
    AllocResult, Allocator, LocalUser, PowerControl, PowerState, Target,
};

/// Allocator over a throwaway state directory.
pub struct Lab {
    pub dir: TempDir,
    pub allocator: Allocator,
}

pub fn config(dir: &TempDir) -> AllocatorConfig {
    AllocatorConfig {
        state_path: dir.path().join("state"),
        lock_timeout_ms: 5_000,
        lock_wait_ms: 5,
        ..AllocatorConfig::default()
    }
}

pub fn lab_config(dir: &TempDir, targets: &[&str]) -> LabConfig {
    LabConfig {
        allocator: config(dir),
        targets: targets
            .iter()
            .map(|t| ((*t).to_string(), TargetConfig::default()))
            .collect::<BTreeMap<_, _>>(),
    }
}

pub fn lab(targets: &[&str]) -> Lab {
    lab_with(targets, |_| {}, |_, _, target| Ok(target))
}

pub fn lab_with<C, F>(targets: &[&str], tweak: C, decorate: F) -> Lab
where
    C: FnOnce(&mut LabConfig),
    F: FnMut(&str, &TargetConfig, Target) -> AllocResult<Target>,
{
    lab_allocator::util::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = lab_config(&dir, targets);
    tweak(&mut cfg);
    let allocator = build_allocator(&cfg, decorate).unwrap();
    Lab { dir, allocator }
}

/// A second allocator on the same state directory, as another daemon
/// process would have.
pub fn sibling(lab: &Lab, targets: &[&str]) -> Allocator {
    build_allocator(&lab_config(&lab.dir, targets), |_, _, target| Ok(target)).unwrap()
}

pub fn alice() -> LocalUser {
    LocalUser::new("alice")
}

pub fn bob() -> LocalUser {
    LocalUser::new("bob")
}

pub fn admin() -> LocalUser {
    LocalUser::admin("root")
}

/// Power control that records what it was asked to do.
pub struct FakePower {
    pub state: Mutex<PowerState>,
    pub calls: Mutex<Vec<(String, bool)>>,
}

impl FakePower {
    pub fn new(state: PowerState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<(String, bool)> {
        self.calls.lock().clone()
    }
}

impl PowerControl for FakePower {
    fn state(&self, _target: &Target) -> AllocResult<PowerState> {
        Ok(*self.state.lock())
    }

    fn power_off(&self, target: &Target, explicit: bool) -> AllocResult<()> {
        self.calls.lock().push((target.id().to_string(), explicit));
        *self.state.lock() = if explicit {
            PowerState::FullyOff
        } else {
            PowerState::Off
        };
        Ok(())
    }
}
