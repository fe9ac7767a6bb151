//! Benchmarks for work partitioning and end-to-end dispatch using criterion.
//!
//! - Partitioning lists of various sizes across a fixed worker count
//! - Dispatching a batch through scripted sessions with zeroed delays

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use sortie::*;
use sortie_testkit::{
    InMemoryIdentityStore, ScriptedAuthority, ScriptedBackend, SessionScript, identity,
    quick_config, test_machine,
};
use tokio::runtime::Runtime;

/// Creates a tokio runtime for async benchmarks.
fn create_runtime() -> Runtime {
    Runtime::new().expect("Failed to create tokio runtime")
}

fn items(n: usize) -> Vec<WorkItem> {
    (0..n)
        .map(|i| WorkItem::new(format!("user{i}"), format!("payload {i}"), "https://t"))
        .collect()
}

/// Benchmark: divide a list across 8 workers.
fn bench_divide(c: &mut Criterion) {
    let mut group = c.benchmark_group("divide");

    for size in [10usize, 1_000, 100_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || items(size),
                |list| divide(list, 8),
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

/// Benchmark: dispatch 32 items over 4 workers with scripted sessions.
fn bench_dispatch(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("dispatch");
    group.sample_size(20);
    group.measurement_time(Duration::from_secs(10));

    let people: Vec<Identity> = (0..32)
        .map(|i| identity(&format!("user{i}"), &["ok"]))
        .collect();
    let store = InMemoryIdentityStore::new().with_identities(DEFAULT_FOLDER, people);
    let dispatcher = DispatcherBuilder::new(quick_config())
        .with_backend(Arc::new(ScriptedBackend::new(SessionScript::default())))
        .with_identity_store(Arc::new(store))
        .build()
        .expect("dispatcher builds");
    let lease = LeaseClient::with_interval(
        Arc::new(ScriptedAuthority::approving()),
        test_machine(),
        Duration::from_secs(1800),
    );
    rt.block_on(lease.acquire("bench@example.com", "secret"))
        .expect("lease acquired");

    group.throughput(Throughput::Elements(32));
    group.bench_function("32_items_4_workers", |b| {
        b.iter(|| {
            let pairs: Vec<(String, String)> = (0..32)
                .map(|i| (format!("user{i}"), format!("payload {i}")))
                .collect();
            rt.block_on(dispatcher.submit("https://t", pairs, 4, DEFAULT_FOLDER, &lease))
                .expect("dispatch accepted")
        });
    });

    group.finish();
    rt.block_on(lease.release());
}

criterion_group!(benches, bench_divide, bench_dispatch);
criterion_main!(benches);
