//! Tests for the API entry points and tokio spawner

use std::sync::Arc;
use std::time::Duration;

use lab_allocator::builders::build_allocator;
use lab_allocator::config::{LabConfig, TargetConfig};
use lab_allocator::core::{AllocationState, Allocator, Identity, LocalUser};
use lab_allocator::runtime::{keepalive_many, list_targets, submit_request_json, KeepaliveRequest};

fn allocator(dir: &tempfile::TempDir) -> Allocator {
    let mut cfg = LabConfig::default();
    cfg.allocator.state_path = dir.path().to_path_buf();
    cfg.allocator.lock_wait_ms = 5;
    cfg.targets.insert("t0".to_string(), TargetConfig::default());
    cfg.targets.insert("t1".to_string(), TargetConfig::default());
    build_allocator(&cfg, |_, _, t| Ok(t)).unwrap()
}

#[test]
fn test_submit_json_and_list_targets() {
    let dir = tempfile::tempdir().unwrap();
    let allocator = allocator(&dir);
    let alice = LocalUser::new("alice");
    let bob = LocalUser::new("bob");

    let first = submit_request_json(&allocator, r#"{"groups": {"g": ["t0"]}}"#, &alice).unwrap();
    assert_eq!(first.state, AllocationState::Active);
    let second = submit_request_json(
        &allocator,
        r#"{"groups": {"g": ["t0"]}, "queue": true}"#,
        &bob,
    )
    .unwrap();
    assert_eq!(second.state, AllocationState::Queued);

    let targets = list_targets(&allocator).unwrap();
    assert_eq!(targets.len(), 2);
    assert_eq!(targets[0].name, "t0");
    assert_eq!(targets[0].owner, first.alloc_id);
    assert_eq!(targets[0].owner_user.as_deref(), Some("alice"));
    assert_eq!(targets[0].queue_len, 1);
    assert_eq!(targets[1].owner, None);
    assert_eq!(targets[1].queue_len, 0);
}

#[test]
fn test_submit_json_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let allocator = allocator(&dir);
    let err = submit_request_json(&allocator, "{groups", &LocalUser::new("alice")).unwrap_err();
    assert!(err.starts_with("parse error"));
}

#[test]
fn test_keepalive_many() {
    let dir = tempfile::tempdir().unwrap();
    let allocator = allocator(&dir);
    let alice = LocalUser::new("alice");
    let reply = submit_request_json(&allocator, r#"{"groups": {"g": ["t1"]}}"#, &alice).unwrap();
    let alloc_id = reply.alloc_id.unwrap();

    let body = format!(r#"{{"allocations": {{"{alloc_id}": "active", "zzzzzzzz": null}}}}"#);
    let request: KeepaliveRequest = serde_json::from_str(&body).unwrap();
    let replies = keepalive_many(&allocator, &request, &alice).unwrap();
    assert_eq!(replies[&alloc_id].state, AllocationState::Active);
    assert_eq!(replies["zzzzzzzz"].state, AllocationState::Invalid);
}

#[cfg(feature = "tokio-runtime")]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tokio_spawner_runs_maintenance() {
    let dir = tempfile::tempdir().unwrap();
    let allocator = Arc::new(allocator(&dir));
    let alice = LocalUser::new("alice");
    let reply = submit_request_json(&allocator, r#"{"groups": {"g": ["t0"]}}"#, &alice).unwrap();
    let alloc_id = reply.alloc_id.unwrap();

    let spawner = lab_allocator::runtime::TokioSpawner::new(tokio::runtime::Handle::current());
    let user: Arc<dyn Identity> = Arc::new(LocalUser::admin("maintenance"));
    let handle = spawner.spawn_maintenance(Arc::clone(&allocator), user, Duration::from_millis(20));
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.abort();

    // a fresh allocation survives the sweeps
    let state = allocator.get(&alloc_id, &alice).unwrap().state;
    assert_eq!(state, AllocationState::Active);
}
