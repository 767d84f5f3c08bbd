//! Storage primitives: the file-backed KV store, cross-process locks, the
//! handle cache and the client UUID replay guard.

pub mod cache;
pub mod fsdb;
pub mod lock;
pub mod replay;

pub use cache::AgedLruCache;
pub use fsdb::{Fsdb, Value};
pub use lock::{FileLock, FileLockGuard};
pub use replay::ReplayGuard;
