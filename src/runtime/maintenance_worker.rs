//! Background maintenance on a dedicated OS thread.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{bounded, select, tick, Sender};

use crate::core::{AppResult, Allocator, Identity};

/// Runs [`Allocator::maintenance`] every `period` until shut down.
pub struct MaintenanceWorker {
    shutdown: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl MaintenanceWorker {
    /// Start the worker thread. Sweeps run as `user`.
    pub fn spawn(
        allocator: Arc<Allocator>,
        user: Arc<dyn Identity>,
        period: Duration,
    ) -> AppResult<Self> {
        let (shutdown, stop) = bounded::<()>(1);
        let ticker = tick(period);
        let handle = thread::Builder::new()
            .name("lab-alloc-maintenance".into())
            .spawn(move || loop {
                select! {
                    recv(stop) -> _ => {
                        tracing::debug!("maintenance worker stopping");
                        break;
                    }
                    recv(ticker) -> _ => match allocator.maintenance(Utc::now(), user.as_ref()) {
                        Ok(report) => tracing::debug!(
                            expired = report.expired.len(),
                            powered_off = report.powered_off.len() + report.fully_powered_off.len(),
                            "maintenance sweep done"
                        ),
                        Err(err) => tracing::error!(%err, "maintenance sweep failed"),
                    },
                }
            })?;
        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    /// Stop the worker and wait for it; a sweep in progress finishes first.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.shutdown.try_send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("maintenance worker panicked");
            }
        }
    }
}

impl Drop for MaintenanceWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
