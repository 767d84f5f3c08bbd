//! Benchmarks for the on-disk wait queue and the request path.
//!
//! Benchmarks cover:
//! - Queue key encoding and parsing
//! - Loading and ordering a target's queue from disk
//! - Request/delete cycles through the scheduler

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::time::Duration;

use lab_allocator::builders::build_allocator;
use lab_allocator::config::{LabConfig, TargetConfig};
use lab_allocator::core::wait_queue::{self, encode_key, Waiter};
use lab_allocator::core::{AllocationRequest, LocalUser, Target, TargetProperties};
use lab_allocator::util::{generate_alloc_id, now_stamp};

// ============================================================================
// Helper Functions
// ============================================================================

fn bench_target(dir: &tempfile::TempDir) -> Target {
    Target::open(
        "bench0",
        dir.path().join("bench0"),
        Duration::from_secs(5),
        Duration::from_millis(1),
        TargetProperties::default(),
    )
    .expect("open target")
}

fn fill_queue(target: &Target, size: u32) {
    let stamp = now_stamp();
    for n in 0..size {
        let id = generate_alloc_id();
        wait_queue::enqueue(target, (n % 7) * 1_000, &stamp, n % 5 == 0, false, &id)
            .expect("enqueue");
    }
}

// ============================================================================
// Key Benchmarks
// ============================================================================

fn bench_key_codec(c: &mut Criterion) {
    let stamp = now_stamp();
    let id = generate_alloc_id();
    let key = encode_key(50_000, &stamp, true, false, &id);

    c.bench_function("queue_key_encode", |b| {
        b.iter(|| encode_key(black_box(50_000), black_box(&stamp), true, false, black_box(&id)));
    });
    c.bench_function("queue_key_parse", |b| {
        b.iter(|| Waiter::parse(black_box(&key), Some(black_box(id.as_str()))).expect("parse"));
    });
}

// ============================================================================
// Queue Benchmarks
// ============================================================================

fn bench_queue_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_load");

    for size in [10, 100, 1_000] {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = bench_target(&dir);
        fill_queue(&target, size);

        group.throughput(Throughput::Elements(u64::from(size)));
        group.bench_with_input(BenchmarkId::from_parameter(size), &target, |b, target| {
            b.iter(|| {
                let (waiters, _) = wait_queue::load(target, |_| true).expect("load");
                black_box(waiters.len())
            });
        });
    }

    group.finish();
}

// ============================================================================
// End-to-End Benchmarks
// ============================================================================

fn bench_request_delete(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut cfg = LabConfig::default();
    cfg.allocator.state_path = dir.path().to_path_buf();
    cfg.allocator.lock_wait_ms = 1;
    for name in ["t0", "t1", "t2"] {
        cfg.targets.insert(name.to_string(), TargetConfig::default());
    }
    let allocator = build_allocator(&cfg, |_, _, target| Ok(target)).expect("allocator");
    let user = LocalUser::new("bench");
    let request = AllocationRequest::new()
        .group("pair", ["t0", "t1"])
        .group("single", ["t2"]);

    c.bench_function("request_delete_cycle", |b| {
        b.iter(|| {
            let reply = allocator.request(black_box(&request), &user).expect("request");
            let alloc_id = reply.alloc_id.expect("allocation id");
            allocator.delete(&alloc_id, &user).expect("delete");
        });
    });
}

criterion_group!(benches, bench_key_codec, bench_queue_load, bench_request_delete);
criterion_main!(benches);
