//! Tests for error types

use std::path::PathBuf;
use std::time::Duration;

use lab_allocator::core::AllocatorError;

#[test]
fn test_invalid_error() {
    let err = AllocatorError::Invalid("ab_CD123".to_string());
    assert_eq!(format!("{}", err), "invalid allocation: ab_CD123");
    assert!(err.is_invalid());
}

#[test]
fn test_lock_timeout_error() {
    let err = AllocatorError::LockTimeout {
        path: PathBuf::from("/tmp/t0/.lock"),
        waited: Duration::from_secs(2),
    };
    assert_eq!(
        format!("{}", err),
        "timed out after 2s waiting for lock /tmp/t0/.lock"
    );
    assert!(!err.is_invalid());
}

#[test]
fn test_corrupt_error() {
    let err = AllocatorError::Corrupt {
        key: "owner".to_string(),
        reason: "not json".to_string(),
    };
    assert_eq!(format!("{}", err), "corrupt record owner: not json");
}

#[test]
fn test_io_error_converts() {
    let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
    let err: AllocatorError = io.into();
    assert!(matches!(err, AllocatorError::Io(_)));
    assert_eq!(format!("{}", err), "io error: denied");
}

#[test]
fn test_serde_error_converts() {
    let parse = serde_json::from_str::<u32>("nope").unwrap_err();
    let err: AllocatorError = parse.into();
    assert!(matches!(err, AllocatorError::Serialization(_)));
}
