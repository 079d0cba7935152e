//! Propagation benchmarks: deep chains and wide fan-outs.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use sundial_core::reactive::{batch, Computation, Signal};

fn chain_propagation(c: &mut Criterion) {
    c.bench_function("chain_depth_100", |b| {
        let source = Signal::new(0i64);
        let mut tail = Computation::new(move || source.get());
        for _ in 0..100 {
            let prev = tail;
            tail = Computation::new(move || prev.get() + 1);
        }
        let mut value = 0i64;
        b.iter(|| {
            value += 1;
            source.set(black_box(value)).unwrap();
            black_box(tail.get())
        });
    });
}

fn fanout_propagation(c: &mut Criterion) {
    c.bench_function("fanout_100_batched", |b| {
        let source = Signal::new(0i64);
        let readers: Vec<_> = (0..100i64)
            .map(|offset| Computation::new(move || source.get() + offset))
            .collect();
        let mut value = 0i64;
        b.iter(|| {
            value += 1;
            batch(|| {
                source.set(black_box(value)).unwrap();
            })
            .unwrap();
            black_box(readers.last().expect("readers exist").get())
        });
    });
}

criterion_group!(benches, chain_propagation, fanout_propagation);
criterion_main!(benches);
