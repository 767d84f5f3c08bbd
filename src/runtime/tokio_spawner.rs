//! Tokio runtime driver for the maintenance sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::core::{Allocator, Identity};

/// Spawns allocator background work on a tokio runtime.
#[derive(Clone)]
pub struct TokioSpawner {
    handle: tokio::runtime::Handle,
}

impl TokioSpawner {
    /// Create a new `TokioSpawner` from a tokio runtime handle.
    pub const fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Spawner on the runtime the caller is running in.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }

    /// Run the maintenance sweep every `period`, on the blocking pool since
    /// it takes file locks. Abort the returned handle to stop it.
    pub fn spawn_maintenance(
        &self,
        allocator: Arc<Allocator>,
        user: Arc<dyn Identity>,
        period: Duration,
    ) -> JoinHandle<()> {
        self.handle.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let allocator = Arc::clone(&allocator);
                let user = Arc::clone(&user);
                let swept = tokio::task::spawn_blocking(move || {
                    allocator.maintenance(Utc::now(), user.as_ref())
                })
                .await;
                match swept {
                    Ok(Ok(report)) => tracing::debug!(expired = report.expired.len(), "maintenance sweep done"),
                    Ok(Err(err)) => tracing::error!(%err, "maintenance sweep failed"),
                    Err(err) => tracing::error!(%err, "maintenance task failed"),
                }
            }
        })
    }
}

/// Run the maintenance sweep every `period` on the current tokio runtime.
pub fn spawn_maintenance(
    allocator: Arc<Allocator>,
    user: Arc<dyn Identity>,
    period: Duration,
) -> JoinHandle<()> {
    TokioSpawner::current().spawn_maintenance(allocator, user, period)
}
