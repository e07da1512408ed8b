/*!
 * Lock Benchmarks
 *
 * Uncontended fast paths, contended handoff, and the read side of the
 * read-write lock.
 */

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use qlock::{ReentrantLock, ReentrantRwLock};
use std::sync::Arc;
use std::thread;

fn bench_uncontended(c: &mut Criterion) {
    let mut group = c.benchmark_group("uncontended");

    let nonfair = ReentrantLock::new();
    group.bench_function("mutex_nonfair", |b| {
        b.iter(|| {
            nonfair.lock();
            black_box(());
            nonfair.unlock();
        });
    });

    let fair = ReentrantLock::new_fair();
    group.bench_function("mutex_fair", |b| {
        b.iter(|| {
            fair.lock();
            black_box(());
            fair.unlock();
        });
    });

    let rw = ReentrantRwLock::new();
    group.bench_function("rwlock_read", |b| {
        b.iter(|| {
            rw.read().lock();
            black_box(());
            rw.read().unlock();
        });
    });

    group.bench_function("rwlock_write", |b| {
        b.iter(|| {
            rw.write().lock();
            black_box(());
            rw.write().unlock();
        });
    });

    group.finish();
}

fn bench_contended_handoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended_handoff");
    group.sample_size(10);

    for threads in [2usize, 4] {
        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            &threads,
            |b, &threads| {
                b.iter(|| {
                    let lock = ReentrantLock::new();
                    let workers: Vec<_> = (0..threads)
                        .map(|_| {
                            let lock = lock.clone();
                            thread::spawn(move || {
                                for _ in 0..1_000 {
                                    lock.lock();
                                    black_box(());
                                    lock.unlock();
                                }
                            })
                        })
                        .collect();
                    for worker in workers {
                        worker.join().unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

fn bench_shared_readers(c: &mut Criterion) {
    let mut group = c.benchmark_group("shared_readers");
    group.sample_size(10);

    group.bench_function("4_readers", |b| {
        b.iter(|| {
            let rw = Arc::new(ReentrantRwLock::new());
            let readers: Vec<_> = (0..4)
                .map(|_| {
                    let rw = rw.clone();
                    thread::spawn(move || {
                        for _ in 0..1_000 {
                            rw.read().lock();
                            black_box(());
                            rw.read().unlock();
                        }
                    })
                })
                .collect();
            for reader in readers {
                reader.join().unwrap();
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_uncontended,
    bench_contended_handoff,
    bench_shared_readers
);
criterion_main!(benches);
