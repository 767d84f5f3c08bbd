//! Tests for audit sink

use lab_allocator::core::{build_audit_event, AuditSink, InMemoryAuditSink, TracingAuditSink};

#[test]
fn test_in_memory_audit_sink() {
    let mut sink = InMemoryAuditSink::new(10);

    let event = build_audit_event(
        "ab_CD123",
        Some("t0".to_string()),
        "alice",
        "assign",
        Some("group g1".to_string()),
    );

    sink.record(event.clone());
    assert_eq!(sink.events().len(), 1);

    let events = sink.events();
    assert_eq!(events[0].alloc_id, "ab_CD123");
    assert_eq!(events[0].target.as_deref(), Some("t0"));
    assert_eq!(events[0].action, "assign");
}

#[test]
fn test_audit_sink_overflow() {
    let mut sink = InMemoryAuditSink::new(2);

    sink.record(build_audit_event("alloc001", None, "alice", "request", None));
    sink.record(build_audit_event("alloc002", None, "alice", "request", None));
    sink.record(build_audit_event("alloc003", None, "alice", "request", None));

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].alloc_id, "alloc002"); // First one popped
    assert_eq!(events[1].alloc_id, "alloc003");
}

#[test]
fn test_build_audit_event() {
    let event = build_audit_event(
        "ab_CD123",
        None,
        "bob",
        "delete",
        Some("removed".to_string()),
    );

    assert_eq!(event.alloc_id, "ab_CD123");
    assert_eq!(event.user, "bob");
    assert_eq!(event.action, "delete");
    assert_eq!(event.payload, Some("removed".to_string()));
    assert!(event.target.is_none());
    assert!(event.created_at_ms > 0);
    assert!(event.event_id.starts_with("ab_CD123-delete-"));
}

#[test]
fn test_tracing_sink_accepts_events() {
    let mut sink = TracingAuditSink;
    sink.record(build_audit_event("ab_CD123", Some("t1".into()), "root", "preempt", None));
}
