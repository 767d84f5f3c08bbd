//! Allocation engine: records, queues, scheduling and the public API.

pub mod allocation;
pub mod allocator;
pub mod audit;
pub mod error;
pub mod identity;
pub mod maintenance;
pub mod reply;
pub mod request;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod target;
pub mod wait_queue;

pub use allocation::{Allocation, GroupOutcome};
pub use allocator::Allocator;
pub use audit::{
    build_audit_event, AuditEvent, AuditSink, InMemoryAuditSink, SharedAuditSink, TracingAuditSink,
};
pub use error::{AllocResult, AllocatorError, AppResult};
pub use identity::{AdminPreemptPolicy, AllocationPolicy, Identity, LocalUser, PolicyRequest};
pub use maintenance::MaintenanceReport;
pub use reply::{AllocationReply, AllocationView};
pub use request::AllocationRequest;
pub use scheduler::Scheduler;
pub use state::AllocationState;
pub use store::AllocationStore;
pub use target::{
    AssignHook, PowerControl, PowerState, ReleaseHook, Target, TargetProperties, TargetRegistry,
};
pub use wait_queue::Waiter;
