//! # Lab Allocator
//!
//! A preemptable, priority-queue based allocator for scarce lab hardware.
//!
//! Test jobs ask for *groups* of targets (boards, probes, network
//! switches). Any one group satisfies the request, and a group is only
//! handed out whole. Requests carry a priority; higher priority requests
//! may evict lower priority holders when they ask for it and policy allows.
//!
//! All state lives on disk. Several daemon processes may serve the same
//! lab at once: they coordinate through advisory file locks and through the
//! queue order encoded in file names, and a crashed process leaves nothing
//! that the next scheduler pass cannot repair.
//!
//! ## Core Problem Solved
//!
//! - **All-or-nothing reservations**: a job needing a board plus its power
//!   switch must never sit on one while waiting forever for the other
//! - **Fair ordering across processes**: for any target, waiters are
//!   granted by priority and then by arrival, whichever process decides
//! - **Abandoned reservations**: clients that stop sending keepalives lose
//!   their targets; idle hardware gets powered off
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use lab_allocator::builders::build_allocator;
//! use lab_allocator::config::LabConfig;
//! use lab_allocator::core::{AllocationRequest, LocalUser};
//!
//! let cfg = LabConfig::from_json_str(r#"{"targets": {"t0": {}, "t1": {}}}"#)?;
//! let allocator = build_allocator(&cfg, |_, _, target| Ok(target))?;
//!
//! let reply = allocator.request(
//!     &AllocationRequest::new().group("g1", ["t0"]).queue(true),
//!     &LocalUser::new("alice"),
//! )?;
//! // reply.state is `active` or `queued`; keep it alive while in use
//! let alloc_id = reply.alloc_id.unwrap();
//! allocator.keepalive(&alloc_id, Some(reply.state), 0, &LocalUser::new("alice"))?;
//! allocator.delete(&alloc_id, &LocalUser::new("alice"))?;
//! ```
//!
//! Run [`core::Allocator::maintenance`] periodically, either with
//! `runtime::MaintenanceWorker` or, with the `tokio-runtime` feature,
//! `runtime::spawn_maintenance`.

/// Allocation engine: records, queues, scheduling and the public API.
pub mod core;
/// Configuration models for the allocator and its targets.
pub mod config;
/// Builders to construct allocator components from configuration.
pub mod builders;
/// Storage primitives: KV store, file locks, caches.
pub mod infra;
/// Runtime adapters (worker thread, tokio) and API surface.
pub mod runtime;
/// Shared utilities.
pub mod util;
