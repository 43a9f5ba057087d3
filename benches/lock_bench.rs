use config::Config;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use crossbeam_utils::thread;
use std::sync::mpsc;

use lockstep::lock::mode::{LockMode, Precision};
use lockstep::lock::{PageId, RecordId};
use lockstep::manager::{LockManager, WaitPolicy};

fn setup(threads: i64, transactions: i64) -> (LockManager, i64, i64) {
    let mut config = Config::default();
    config.set("shards", 64i64).unwrap();
    config.set("max_locks", 1_000_000i64).unwrap();
    config.set("spin_rounds", 128i64).unwrap();
    config.set("cores", threads).unwrap();

    let manager = LockManager::from_config(&config).unwrap();

    (manager, threads, transactions)
}

fn run(data: (LockManager, i64, i64)) {
    let (manager, threads, transactions) = data;
    let per_thread = transactions / threads;

    let (tx, rx) = mpsc::channel();

    thread::scope(|s| {
        let manager = &manager;

        for thread_id in 0..threads {
            let txc = tx.clone();

            s.builder()
                .name(thread_id.to_string())
                .spawn(move |_| {
                    for i in 0..per_thread {
                        let id = 1 + (thread_id * per_thread + i) as u64;
                        manager.register(id, false, false);

                        // disjoint pages per thread; no waits on this path
                        let page = PageId::new(0, thread_id as u32 * 1024 + (i % 512) as u32);
                        for heap in 2..6 {
                            manager
                                .lock_record(
                                    id,
                                    1,
                                    RecordId::new(page, heap),
                                    LockMode::Exclusive,
                                    Precision::NextKey,
                                    WaitPolicy::NoWait,
                                )
                                .unwrap();
                        }

                        manager.release_all(id).unwrap();
                        manager.deregister(id);
                    }
                    txc.send(per_thread).unwrap();
                })
                .unwrap();
        }
    })
    .unwrap();

    drop(tx);

    let mut completed = 0;
    while let Ok(n) = rx.recv() {
        completed += n;
    }
    assert_eq!(completed, per_thread * threads);
}

pub fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("lock cycle 1", move |b| {
        b.iter_batched(
            || setup(1, 10000),
            |data| run(data),
            BatchSize::PerIteration,
        )
    });
    c.bench_function("lock cycle 4", move |b| {
        b.iter_batched(
            || setup(4, 10000),
            |data| run(data),
            BatchSize::PerIteration,
        )
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
