//! Tests for builder modules

use lab_allocator::builders::{build_allocator, build_registry};
use lab_allocator::config::{LabConfig, TargetConfig};
use lab_allocator::core::{AllocatorError, TargetProperties};

fn lab_config(dir: &tempfile::TempDir, targets: &[&str]) -> LabConfig {
    let mut cfg = LabConfig::default();
    cfg.allocator.state_path = dir.path().to_path_buf();
    for name in targets {
        cfg.targets.insert((*name).to_string(), TargetConfig::default());
    }
    cfg
}

#[test]
fn test_build_registry_opens_every_target() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = lab_config(&dir, &["t0", "t1"]);
    cfg.targets.get_mut("t1").unwrap().skip_cleanup = true;

    let mut seen = Vec::new();
    let registry = build_registry(&cfg, |name, _, target| {
        seen.push(name.to_string());
        Ok(target)
    })
    .unwrap();

    assert_eq!(seen, vec!["t0", "t1"]);
    assert_eq!(registry.names().collect::<Vec<_>>(), vec!["t0", "t1"]);
    assert_eq!(
        registry.get("t1").unwrap().properties(),
        &TargetProperties {
            skip_cleanup: true,
            ..TargetProperties::default()
        }
    );
    assert!(dir.path().join("targets").join("t0").is_dir());
}

#[test]
fn test_build_registry_rejects_empty_config() {
    let dir = tempfile::tempdir().unwrap();
    let err = build_registry(&lab_config(&dir, &[]), |_, _, t| Ok(t)).unwrap_err();
    assert!(matches!(err, AllocatorError::Config(_)));
}

#[test]
fn test_build_registry_propagates_decorator_errors() {
    let dir = tempfile::tempdir().unwrap();
    let err = build_registry(&lab_config(&dir, &["t0"]), |name, _, _| {
        Err(AllocatorError::Config(format!("no power driver for {name}")))
    })
    .unwrap_err();
    assert_eq!(err.to_string(), "config error: no power driver for t0");
}

#[test]
fn test_build_allocator() {
    let dir = tempfile::tempdir().unwrap();
    let allocator = build_allocator(&lab_config(&dir, &["t0"]), |_, _, t| Ok(t)).unwrap();
    assert_eq!(allocator.registry().len(), 1);
    assert!(allocator.store().ids().unwrap().is_empty());
}
