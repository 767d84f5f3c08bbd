//! Tests for configuration validation

use std::collections::HashMap;
use std::path::PathBuf;

use lab_allocator::config::{AllocatorConfig, LabConfig, TargetConfig};

#[test]
fn test_allocator_config_defaults_are_valid() {
    let cfg = AllocatorConfig::default();
    assert!(cfg.validate().is_ok());
    assert_eq!(cfg.max_idle_secs, 30);
    assert_eq!(cfg.default_priority, 50);
    assert_eq!(cfg.allocations_path(), PathBuf::from("state/allocations"));
    assert_eq!(cfg.target_path("t0"), PathBuf::from("state/targets/t0"));
}

#[test]
fn test_allocator_config_invalid_idle() {
    let invalid = AllocatorConfig {
        max_idle_secs: 0,
        ..AllocatorConfig::default()
    };
    assert!(invalid.validate().is_err());
}

#[test]
fn test_allocator_config_invalid_lock_wait() {
    let invalid = AllocatorConfig {
        lock_timeout_ms: 100,
        lock_wait_ms: 200,
        ..AllocatorConfig::default()
    };
    assert!(invalid.validate().is_err());
}

#[test]
fn test_allocator_config_invalid_priority() {
    let invalid = AllocatorConfig {
        default_priority: 10_000,
        ..AllocatorConfig::default()
    };
    assert!(invalid.validate().is_err());
}

#[test]
fn test_allocator_config_from_lookup() {
    let vars: HashMap<&str, &str> = [
        ("LAB_ALLOC_STATE_PATH", "/var/lib/lab"),
        ("LAB_ALLOC_MAX_IDLE_SECS", "90"),
        ("LAB_ALLOC_CACHE_MAX_ENTRIES", " 16 "),
        ("LAB_ALLOC_DEFAULT_PRIORITY", "500"),
    ]
    .into_iter()
    .collect();

    let cfg =
        AllocatorConfig::from_lookup(|name| vars.get(name).map(|v| (*v).to_string())).unwrap();
    assert_eq!(cfg.state_path, PathBuf::from("/var/lib/lab"));
    assert_eq!(cfg.max_idle_secs, 90);
    assert_eq!(cfg.cache_max_entries, 16);
    assert_eq!(cfg.default_priority, 500);
    assert_eq!(cfg.lock_timeout_ms, AllocatorConfig::default().lock_timeout_ms);
}

#[test]
fn test_allocator_config_from_lookup_bad_number() {
    let err = AllocatorConfig::from_lookup(|name| {
        (name == "LAB_ALLOC_MAX_TTL_SECS").then(|| "soon".to_string())
    })
    .unwrap_err();
    assert!(err.contains("LAB_ALLOC_MAX_TTL_SECS"));
}

#[test]
fn test_lab_config_validation() {
    let mut cfg = LabConfig::default();
    assert!(cfg.validate().is_err());

    cfg.targets.insert("t0".to_string(), TargetConfig::default());
    assert!(cfg.validate().is_ok());

    cfg.targets.insert("bad name".to_string(), TargetConfig::default());
    assert!(cfg.validate().is_err());
}

#[test]
fn test_lab_config_from_json() {
    let json = r#"{
        "allocator": {
            "state_path": "/srv/lab",
            "max_idle_secs": 45
        },
        "targets": {
            "board1": {},
            "switch1": {
                "skip_cleanup": true,
                "idle_power_off_secs": 600
            }
        }
    }"#;

    let cfg = LabConfig::from_json_str(json).unwrap();
    assert_eq!(cfg.allocator.max_idle_secs, 45);
    assert_eq!(cfg.allocator.lock_wait_ms, 300);
    let switch = &cfg.targets["switch1"];
    assert!(switch.skip_cleanup);
    assert_eq!(switch.properties().idle_power_off_secs, Some(600));
    assert_eq!(switch.properties().idle_power_fully_off_secs, None);
}

#[test]
fn test_lab_config_from_json_requires_targets() {
    assert!(LabConfig::from_json_str(r#"{"targets": {}}"#).is_err());
    assert!(LabConfig::from_json_str("{").is_err());
}
