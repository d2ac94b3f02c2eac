use std::sync::Arc;
use std::thread;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dashmap::DashMap;
use stripemap_rs::StripeMap;

const THREADS: u64 = 4;
const OPS_PER_THREAD: u64 = 10_000;

fn threaded_mixed_stripemap(c: &mut Criterion) {
    c.bench_function("stripemap_threaded_mixed", |b| {
        b.iter(|| {
            let map = Arc::new(StripeMap::<u64, u64>::with_hashpower(12));
            let handles: Vec<_> = (0..THREADS)
                .map(|t| {
                    let map = Arc::clone(&map);
                    thread::spawn(move || {
                        for i in 0..OPS_PER_THREAD {
                            let key = t * OPS_PER_THREAD + i;
                            map.insert(key, key);
                            let _ = map.get(&key);
                            if i % 4 == 0 {
                                let _ = map.erase(&key);
                            }
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
            black_box(map.len())
        })
    });
}

fn threaded_mixed_dashmap(c: &mut Criterion) {
    c.bench_function("dashmap_threaded_mixed", |b| {
        b.iter(|| {
            let map = Arc::new(DashMap::<u64, u64>::with_capacity(4096));
            let handles: Vec<_> = (0..THREADS)
                .map(|t| {
                    let map = Arc::clone(&map);
                    thread::spawn(move || {
                        for i in 0..OPS_PER_THREAD {
                            let key = t * OPS_PER_THREAD + i;
                            map.insert(key, key);
                            let _ = map.get(&key);
                            if i % 4 == 0 {
                                let _ = map.remove(&key);
                            }
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
            black_box(map.len())
        })
    });
}

fn threaded_read_heavy_stripemap(c: &mut Criterion) {
    let map = Arc::new(StripeMap::<u64, u64>::with_hashpower(16));
    for i in 0..40_000 {
        map.insert(i, i);
    }
    c.bench_function("stripemap_threaded_read_heavy", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..THREADS)
                .map(|t| {
                    let map = Arc::clone(&map);
                    thread::spawn(move || {
                        let mut hits = 0u64;
                        for i in 0..OPS_PER_THREAD {
                            if map.get(&((i * 7 + t) % 40_000)).is_some() {
                                hits += 1;
                            }
                        }
                        hits
                    })
                })
                .collect();
            let mut total = 0;
            for h in handles {
                total += h.join().unwrap();
            }
            black_box(total)
        })
    });
}

criterion_group!(
    benches,
    threaded_mixed_stripemap,
    threaded_mixed_dashmap,
    threaded_read_heavy_stripemap
);
criterion_main!(benches);
