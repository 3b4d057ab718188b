//! # Scope Bus Benchmarks
//!
//! | Path | Measures |
//! |------|----------|
//! | inprocess publish | informer to listener handler, no serialization |
//! | scope matching | listener scope checks against deep scopes |
//! | request/reply | full round trip through local and remote servers |

use std::time::Duration;

use bus_types::{Event, Scope};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use scope_bus::{Bus, ParticipantConfig};
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
}

// ============================================================================
// INPROCESS PUBLISH
// ============================================================================

fn bench_inprocess_publish(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("inprocess-publish");
    group.measurement_time(Duration::from_secs(10));

    for batch in [1u64, 100, 1000] {
        let bus = Bus::new(ParticipantConfig::default()).unwrap();
        let scope = Scope::new("/bench/publish/").unwrap();
        let mut reader = rt.block_on(bus.create_reader(scope.clone())).unwrap();

        group.throughput(Throughput::Elements(batch));
        group.bench_with_input(BenchmarkId::new("publish_and_receive", batch), &batch, |b, &n| {
            b.iter(|| {
                rt.block_on(async {
                    for i in 0..n {
                        bus.publish(&scope, i).await.unwrap();
                    }
                    for _ in 0..n {
                        black_box(reader.recv().await);
                    }
                })
            })
        });
    }
    group.finish();
}

// ============================================================================
// SCOPE MATCHING
// ============================================================================

fn bench_scope_matching(c: &mut Criterion) {
    let listener = Scope::new("/a/b/").unwrap();
    let deep = Scope::new("/a/b/c/d/e/f/g/h/").unwrap();
    let other = Scope::new("/x/y/z/").unwrap();

    c.bench_function("scope_contains_deep", |b| {
        b.iter(|| black_box(listener.contains(black_box(&deep))))
    });
    c.bench_function("scope_contains_unrelated", |b| {
        b.iter(|| black_box(listener.contains(black_box(&other))))
    });
    c.bench_function("scope_super_scopes", |b| {
        b.iter(|| black_box(deep.super_scopes(true)))
    });
}

// ============================================================================
// REQUEST/REPLY
// ============================================================================

fn bench_request_reply(c: &mut Criterion) {
    let rt = runtime();
    let bus = Bus::new(ParticipantConfig::default()).unwrap();
    let scope = Scope::new("/bench/rpc/").unwrap();
    let local = bus.create_local_server(scope.clone());
    rt.block_on(local.add_method("echo", |request: Event| {
        Ok::<_, anyhow::Error>(request.payload)
    }))
    .unwrap();
    let remote = bus.create_remote_server(scope);

    c.bench_function("rpc_round_trip", |b| {
        b.iter(|| {
            rt.block_on(async {
                let reply: i64 = remote
                    .call("echo", 7i64, Duration::from_secs(5))
                    .await
                    .unwrap();
                black_box(reply)
            })
        })
    });
}

criterion_group!(
    benches,
    bench_inprocess_publish,
    bench_scope_matching,
    bench_request_reply
);
criterion_main!(benches);
