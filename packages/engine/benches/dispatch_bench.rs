//! Dispatch benchmark
//!
//! Measures the path submit → broker dispatch → driver step → drain → retire
//! for units that finish on their first step.

use std::time::{Duration, Instant};

use cadence_engine::runtime::FnUnit;
use cadence_engine::{Outcome, Runtime, RuntimeConfig};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

const WAIT: Duration = Duration::from_secs(30);

fn instant_unit() -> FnUnit {
    FnUnit::new("instant", |_| Outcome::Positive)
}

/// Benchmark one-step units across pool sizes
fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch/one_step");
    group.throughput(Throughput::Elements(1));

    for workers in [0usize, 1, 4] {
        let config = RuntimeConfig::default()
            .with_workers(workers)
            .with_cycle_pause(Duration::ZERO)
            .with_thread_name(format!("bench-{}", workers));
        let runtime = Runtime::init(config).unwrap();

        group.bench_with_input(BenchmarkId::new("workers", workers), &workers, |b, _| {
            b.iter_custom(|iters| {
                let start = Instant::now();
                let handles: Vec<_> = (0..iters)
                    .map(|_| runtime.submit(instant_unit()).unwrap())
                    .collect();
                for handle in &handles {
                    assert!(handle.wait(WAIT));
                }
                start.elapsed()
            });
        });

        runtime.shutdown();
    }

    group.finish();
}

/// Benchmark units pinned to one driver
fn bench_pinned(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch/pinned");
    group.throughput(Throughput::Elements(1));

    let config = RuntimeConfig::default()
        .with_workers(4)
        .with_cycle_pause(Duration::ZERO)
        .with_thread_name("bench-pinned");
    let runtime = Runtime::init(config).unwrap();

    group.bench_function("driver-0", |b| {
        b.iter_custom(|iters| {
            let start = Instant::now();
            let handles: Vec<_> = (0..iters)
                .map(|_| runtime.submit_to(instant_unit(), cadence_engine::DriverId(0)).unwrap())
                .collect();
            for handle in &handles {
                assert!(handle.wait(WAIT));
            }
            start.elapsed()
        });
    });

    runtime.shutdown();
    group.finish();
}

criterion_group!(benches, bench_dispatch, bench_pinned);
criterion_main!(benches);
