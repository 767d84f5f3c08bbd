//! Audit sink implementations.
//!
//! Every state transition an allocation goes through (request, assignment,
//! preemption, removal, expiry, guest changes, idle power-off) is reported
//! as an [`AuditEvent`]. Sinks are pluggable; an in-memory ring buffer and a
//! `tracing` forwarder ship with the crate.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::util::clock::now_ms;

/// Audit event structure.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    /// Event identifier.
    pub event_id: String,
    /// Allocation the event is about.
    pub alloc_id: String,
    /// Target involved, if the event concerns a single one.
    pub target: Option<String>,
    /// User on whose behalf the action happened.
    pub user: String,
    /// Action taken (request, assign, preempt, delete, timedout, overtime,
    /// guest_add, guest_remove, power_off).
    pub action: String,
    /// Timestamp milliseconds.
    pub created_at_ms: u128,
    /// Additional context.
    pub payload: Option<String>,
}

/// Audit sink abstraction.
pub trait AuditSink: Send {
    /// Record an audit event.
    fn record(&mut self, event: AuditEvent);
}

/// Sink shared between the allocator and whoever reads it back.
pub type SharedAuditSink = Arc<Mutex<Box<dyn AuditSink>>>;

/// In-memory audit sink for testing and dev.
pub struct InMemoryAuditSink {
    events: VecDeque<AuditEvent>,
    max_events: usize,
}

impl InMemoryAuditSink {
    /// Create a new in-memory sink with a bounded buffer.
    pub fn new(max_events: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(max_events),
            max_events,
        }
    }

    /// Retrieve a snapshot of stored events.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.iter().cloned().collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&mut self, event: AuditEvent) {
        if self.events.len() >= self.max_events {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }
}

/// Forwards audit events to `tracing` under the `lab_allocator::audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&mut self, event: AuditEvent) {
        tracing::info!(
            target: "lab_allocator::audit",
            event_id = %event.event_id,
            alloc_id = %event.alloc_id,
            target_name = event.target.as_deref().unwrap_or("-"),
            user = %event.user,
            action = %event.action,
            payload = event.payload.as_deref().unwrap_or(""),
            "audit"
        );
    }
}

/// Helper to build an audit event from context.
pub fn build_audit_event(
    alloc_id: impl Into<String>,
    target: Option<String>,
    user: impl Into<String>,
    action: impl Into<String>,
    payload: Option<String>,
) -> AuditEvent {
    let alloc_id = alloc_id.into();
    let action = action.into();
    let created_at_ms = now_ms();
    AuditEvent {
        event_id: format!("{alloc_id}-{action}-{created_at_ms}"),
        alloc_id,
        target,
        user: user.into(),
        action,
        created_at_ms,
        payload,
    }
}

/// Record `event` if a sink is configured.
pub fn record_audit(sink: Option<&SharedAuditSink>, event: AuditEvent) {
    if let Some(sink) = sink {
        sink.lock().record(event);
    }
}
