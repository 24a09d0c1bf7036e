//! Benchmark for the effect interpreter.
//!
//! Measures construction and interpretation cost of common effect shapes:
//! pure values, map and bind chains, memoized lifts, error handling and
//! asynchronous steps.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use lambars_effect::prelude::*;
use std::hint::black_box;
use std::time::Duration;

// =============================================================================
// Synchronous Interpretation
// =============================================================================

fn benchmark_pure(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("effect_pure");
    let env = Env::new();

    group.bench_function("pure_i32", |bencher| {
        bencher.iter(|| {
            let effect = Effect::pure(black_box(42));
            black_box(effect.run(&env))
        });
    });

    group.bench_function("lift", |bencher| {
        bencher.iter(|| {
            let effect = Effect::lift(|_| Ok(black_box(42)));
            black_box(effect.run(&env))
        });
    });

    group.finish();
}

fn benchmark_chains(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("effect_chain");
    let env = Env::new();

    for length in [10, 100, 1_000] {
        group.bench_with_input(BenchmarkId::new("map", length), &length, |bencher, &length| {
            bencher.iter(|| {
                let effect = (0..length).fold(Effect::pure(0_u64), |effect, _| effect.map(|x| x + 1));
                black_box(effect.run(&env))
            });
        });

        group.bench_with_input(BenchmarkId::new("bind", length), &length, |bencher, &length| {
            bencher.iter(|| {
                let effect = (0..length).fold(Effect::pure(0_u64), |effect, _| {
                    effect.bind(|x| Effect::pure(x + 1))
                });
                black_box(effect.run(&env))
            });
        });
    }

    group.finish();
}

fn benchmark_prebuilt_rerun(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("effect_rerun");
    let env = Env::new();
    let effect = (0..1_000).fold(Effect::pure(0_u64), |effect, _| {
        effect.bind(|x| Effect::pure(x + 1))
    });
    let memo = Effect::memo(|_| Ok(black_box(7_u64)));

    group.bench_function("bind_1000", |bencher| {
        bencher.iter(|| black_box(effect.run(&env)));
    });

    group.bench_function("memo_cached", |bencher| {
        bencher.iter(|| black_box(memo.run(&env)));
    });

    group.finish();
}

fn benchmark_error_handling(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("effect_errors");
    let env = Env::new();

    group.bench_function("catch", |bencher| {
        bencher.iter(|| {
            let effect = Effect::<i32>::fail(Error::domain("boom"))
                .map(|x| x + 1)
                .catch(|error| error.kind() == ErrorKind::Domain, |_| Effect::pure(0));
            black_box(effect.run(&env))
        });
    });

    group.bench_function("finally", |bencher| {
        bencher.iter(|| {
            let effect = Effect::pure(1).finally(Effect::unit());
            black_box(effect.run(&env))
        });
    });

    group.finish();
}

// =============================================================================
// Asynchronous Interpretation
// =============================================================================

fn benchmark_async(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("effect_async");
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("benchmark runtime");
    let env = Env::new();

    group.bench_function("lift_async", |bencher| {
        bencher.to_async(&runtime).iter(|| {
            let effect = Effect::lift_async(|_| async { Ok(black_box(3)) });
            let env = env.clone();
            async move { black_box(effect.run_async(&env).await) }
        });
    });

    group.bench_function("bind_async_chain_100", |bencher| {
        bencher.to_async(&runtime).iter(|| {
            let effect = (0..100).fold(Effect::pure(0_u64), |effect, _| {
                effect.bind_async(|x| async move { Ok(x + 1) })
            });
            let env = env.clone();
            async move { black_box(effect.run_async(&env).await) }
        });
    });

    group.bench_function("zero_sleep", |bencher| {
        bencher.to_async(&runtime).iter(|| {
            let effect = Effect::sleep(Duration::ZERO);
            let env = env.clone();
            async move { black_box(effect.run_async(&env).await) }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_pure,
    benchmark_chains,
    benchmark_prebuilt_rerun,
    benchmark_error_handling,
    benchmark_async
);
criterion_main!(benches);
