//! Dispatch benchmarks using criterion.
//!
//! Run with: cargo bench --features benchmarks --bench dispatch

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use effectscope::{effect, named_effect, perform, Effect, Handle};

struct Add(u64, u64);

impl Effect for Add {
    type Output = u64;
}

struct Unrelated;

impl Effect for Unrelated {
    type Output = ();
}

/// Perform with the binding in the innermost frame
fn bench_perform_innermost(c: &mut Criterion) {
    let handle = Handle::new();
    let guard = handle.enter().unwrap();
    guard.on(|a: Add| a.0 + a.1).unwrap();
    guard.on_named::<u64, _>("bench.add", |_| 3).unwrap();

    let mut group = c.benchmark_group("perform_innermost");
    group.bench_function("declared", |b| {
        b.iter(|| perform(black_box(Add(1, 2))).unwrap());
    });
    group.bench_function("named", |b| {
        b.iter(|| perform(effect::<u64>(black_box("bench.add"))).unwrap());
    });
    group.finish();
}

/// Perform through a stack of frames that do not bind the effect
fn bench_perform_through_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("perform_through_frames");

    for depth in [1usize, 8, 64] {
        let bottom = Handle::new();
        let bottom_guard = bottom.enter().unwrap();
        bottom_guard.on(|a: Add| a.0 + a.1).unwrap();

        let fillers: Vec<Handle> = (0..depth).map(|_| Handle::new()).collect();
        let guards: Vec<_> = fillers.iter().map(|h| h.enter().unwrap()).collect();
        for guard in &guards {
            guard.on(|_: Unrelated| ()).unwrap();
        }

        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, _| {
            b.iter(|| perform(black_box(Add(1, 2))).unwrap());
        });

        for guard in guards.into_iter().rev() {
            drop(guard);
        }
    }

    group.finish();
}

/// Enter and exit a handle with one binding
fn bench_scope_lifecycle(c: &mut Criterion) {
    let handle = Handle::new();
    c.bench_function("scope_bind_exit", |b| {
        b.iter(|| {
            handle
                .scope(|h| h.on(|a: Add| a.0 * a.1).unwrap())
                .unwrap()
        });
    });
}

/// Interning lookups for an existing dynamic identity
fn bench_named_identity(c: &mut Criterion) {
    named_effect::<String>("bench.ident");
    c.bench_function("named_effect_cached", |b| {
        b.iter(|| named_effect::<String>(black_box("bench.ident")));
    });
}

criterion_group!(
    benches,
    bench_perform_innermost,
    bench_perform_through_frames,
    bench_scope_lifecycle,
    bench_named_identity
);
criterion_main!(benches);
