//! Structured logging setup.
//!
//! Scheduler decisions log at `debug`, ownership changes at `info` and
//! self-healed queue corruption at `warn`. Audit events go to the
//! `lab_allocator::audit` target when a [`crate::core::TracingAuditSink`]
//! is installed.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_LOG_FILTER: &str = "lab_allocator=info";

/// Install a `fmt` subscriber filtered by `RUST_LOG`, or by
/// [`DEFAULT_LOG_FILTER`] without it. Does nothing if the embedding daemon
/// already installed a subscriber.
pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init();
}
