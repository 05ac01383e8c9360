use core::hint::black_box;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use futures::future::try_join_all;
use keystone::{
    AllocationRange, IdAllocator, LocalAuthority, TimestampAllocator,
    authority::Authority,
    config::AllocatorConfig,
};
use std::{sync::Arc, time::Instant};
use tokio::runtime::Builder;
use tokio_util::sync::CancellationToken;

const TOTAL_ALLOCATIONS: usize = 4096;

fn authority() -> Arc<dyn Authority> {
    Arc::new(LocalAuthority::default())
}

/// Single allocations from one task; almost all are served from cache.
fn bench_sequential(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequential");
    group.throughput(Throughput::Elements(TOTAL_ALLOCATIONS as u64));

    group.bench_function(format!("timestamp/elems/{TOTAL_ALLOCATIONS}"), |b| {
        let rt = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(1)
            .build()
            .unwrap();

        b.to_async(&rt).iter_custom(|iters| async move {
            let cancel = CancellationToken::new();
            let tso = TimestampAllocator::new(authority(), AllocatorConfig::default(), &cancel);
            tso.start();
            let start = Instant::now();
            for _ in 0..iters {
                for _ in 0..TOTAL_ALLOCATIONS {
                    black_box(tso.get_timestamp().await.unwrap());
                }
            }
            let elapsed = start.elapsed();
            tso.close().await;
            elapsed
        });
    });

    group.bench_function(format!("id/elems/{TOTAL_ALLOCATIONS}"), |b| {
        let rt = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(1)
            .build()
            .unwrap();

        b.to_async(&rt).iter_custom(|iters| async move {
            let cancel = CancellationToken::new();
            let ids = IdAllocator::new(authority(), AllocatorConfig::default(), &cancel);
            ids.start();
            let start = Instant::now();
            for _ in 0..iters {
                for _ in 0..TOTAL_ALLOCATIONS {
                    black_box(ids.alloc_one().await.unwrap());
                }
            }
            let elapsed = start.elapsed();
            ids.close().await;
            elapsed
        });
    });

    group.finish();
}

/// Many tasks allocating from one shared timestamp allocator.
fn bench_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended");
    group.sample_size(10);
    group.sampling_mode(criterion::SamplingMode::Flat);
    group.throughput(Throughput::Elements(TOTAL_ALLOCATIONS as u64));

    for tasks in [1, 4, 16, 64] {
        let per_task = TOTAL_ALLOCATIONS / tasks;
        group.bench_function(
            format!("timestamp/elems/{TOTAL_ALLOCATIONS}/tasks/{tasks}"),
            |b| {
                let rt = Builder::new_multi_thread().enable_all().build().unwrap();

                b.to_async(&rt).iter_custom(move |iters| async move {
                    let cancel = CancellationToken::new();
                    let tso = Arc::new(TimestampAllocator::new(
                        authority(),
                        AllocatorConfig::default(),
                        &cancel,
                    ));
                    tso.start();
                    let start = Instant::now();
                    for _ in 0..iters {
                        let handles = (0..tasks).map(|_| {
                            let tso = Arc::clone(&tso);
                            tokio::spawn(async move {
                                for _ in 0..per_task {
                                    black_box(tso.get_timestamp().await?);
                                }
                                keystone::Result::Ok(())
                            })
                        });
                        for result in try_join_all(handles).await.unwrap() {
                            result.unwrap();
                        }
                    }
                    let elapsed = start.elapsed();
                    tso.close().await;
                    elapsed
                });
            },
        );
    }

    group.finish();
}

/// Block requests of varying size, each a contiguous range.
fn bench_blocks(c: &mut Criterion) {
    let mut group = c.benchmark_group("blocks");

    for block in [16_u32, 256, 4096] {
        group.throughput(Throughput::Elements(u64::from(block)));
        group.bench_function(format!("id/block/{block}"), |b| {
            let rt = Builder::new_multi_thread()
                .enable_all()
                .worker_threads(1)
                .build()
                .unwrap();

            b.to_async(&rt).iter_custom(move |iters| async move {
                let cancel = CancellationToken::new();
                let ids = IdAllocator::new(authority(), AllocatorConfig::default(), &cancel);
                ids.start();
                let start = Instant::now();
                for _ in 0..iters {
                    let range: AllocationRange = ids.alloc(block).await.unwrap();
                    black_box(range);
                }
                let elapsed = start.elapsed();
                ids.close().await;
                elapsed
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_sequential, bench_contended, bench_blocks);
criterion_main!(benches);
