//! Runtime adapters (worker thread, tokio) and API surface.

pub mod api;
#[cfg(not(target_arch = "wasm32"))]
pub mod maintenance_worker;
#[cfg(feature = "tokio-runtime")]
pub mod tokio_spawner;

pub use api::{keepalive_many, list_targets, submit_request_json, KeepaliveRequest, TargetSnapshot};
#[cfg(not(target_arch = "wasm32"))]
pub use maintenance_worker::MaintenanceWorker;
#[cfg(feature = "tokio-runtime")]
pub use tokio_spawner::{spawn_maintenance, TokioSpawner};
