//! Scheduler throughput benchmarks.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use radiance_scheduling::TaskBuilder;
use radiance_thread::{TaskDesc, ThreadPool, Waitable};
use std::{
    hint::black_box,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

fn xorshift(mut x: u32) -> u32 {
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    x
}

/// Creates and dispatches batches of tiny tasks, all parked behind one
/// undispatched blocker task so that the queues fill up before any execution
/// starts, then releases the batch and waits for completion.
fn bench_spawn_tasks(c: &mut Criterion) {
    let pool = ThreadPool::global();

    let mut group = c.benchmark_group("spawn_tasks");

    for n_tasks in [1_u32 << 8, 1 << 12, 1 << 16] {
        group.bench_function(BenchmarkId::from_parameter(n_tasks), |b| {
            b.iter(|| {
                let counter = Arc::new(AtomicU32::new(0));
                let waitable = Arc::new(Waitable::new());

                let blocker = pool.create_task(TaskDesc::default());

                let mut desc = TaskDesc::default();
                desc.waitable = Some(Arc::clone(&waitable));
                let batch = pool.create_task(desc);

                for _ in 0..n_tasks {
                    let mut desc = TaskDesc::with_function({
                        let counter = Arc::clone(&counter);
                        move |_context| {
                            counter.fetch_add(1, Ordering::Relaxed);
                        }
                    });
                    desc.dependency = Some(blocker);
                    desc.parent = Some(batch);
                    pool.create_and_dispatch_task(desc);
                }

                pool.dispatch_task(blocker);
                pool.dispatch_task(batch);

                waitable.wait();
                assert_eq!(counter.load(Ordering::Relaxed), n_tasks);
            });
        });
    }

    group.finish();
}

/// XOR-reduces a large array into per-worker accumulators through
/// `TaskBuilder::parallel_for`.
fn bench_parallel_for(c: &mut Criterion) {
    const N_ELEMENTS: u32 = 1 << 22;

    let pool = ThreadPool::global();

    let mut seed = 12345;
    let elements: Arc<Vec<u32>> = Arc::new(
        (0..N_ELEMENTS)
            .map(|_| {
                seed = xorshift(seed);
                seed
            })
            .collect(),
    );

    let accumulators: Arc<Vec<AtomicU32>> =
        Arc::new((0..pool.n_workers()).map(|_| AtomicU32::new(0)).collect());

    c.bench_function("parallel_for_xor_reduce", |b| {
        b.iter(|| {
            let waitable = Arc::new(Waitable::new());

            {
                let mut builder =
                    TaskBuilder::with_waitable(pool.task_pool(), Arc::clone(&waitable));
                let elements = Arc::clone(&elements);
                let accumulators = Arc::clone(&accumulators);
                builder.parallel_for("xor reduce", N_ELEMENTS, move |context, index| {
                    accumulators[context.worker_id.index()]
                        .fetch_xor(elements[index as usize], Ordering::Relaxed);
                });
            }

            waitable.wait();

            black_box(
                accumulators
                    .iter()
                    .fold(0_u32, |hash, accumulator| {
                        hash ^ accumulator.load(Ordering::Relaxed)
                    }),
            );
        });
    });
}

criterion_group!(benches, bench_spawn_tasks, bench_parallel_for);
criterion_main!(benches);
