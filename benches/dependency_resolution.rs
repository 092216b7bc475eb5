use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use regress_runner::{resolve, RegressionFile, Registry, SuiteName};

fn name(s: &str) -> SuiteName {
    SuiteName::new(s).expect("valid suite name")
}

fn chain_registry(len: usize) -> Registry {
    let mut registry = Registry::new();
    registry
        .register(RegressionFile::new(name("s0")))
        .expect("unique suite");
    for i in 1..len {
        let file = RegressionFile::new(name(&format!("s{}", i))).depends_on([name(&format!("s{}", i - 1))]);
        registry.register(file).expect("unique suite");
    }
    registry
}

/// Every suite depends on a shared setup suite and on up to `fan_in` earlier suites.
fn layered_registry(len: usize, fan_in: usize) -> Registry {
    let mut registry = Registry::new();
    registry
        .register(RegressionFile::new(name("test_setup")))
        .expect("unique suite");
    for i in 0..len {
        let deps = std::iter::once(name("test_setup"))
            .chain((i.saturating_sub(fan_in)..i).map(|j| name(&format!("s{}", j))));
        let file = RegressionFile::new(name(&format!("s{}", i))).depends_on(deps);
        registry.register(file).expect("unique suite");
    }
    registry
}

fn bench_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("dependency_resolution");

    for len in [10, 100, 1000] {
        let registry = chain_registry(len);
        let root = name(&format!("s{}", len - 1));
        group.bench_with_input(BenchmarkId::new("chain", len), &root, |b, root| {
            b.iter(|| resolve(black_box(&registry), black_box(root)))
        });
    }

    for len in [10, 100, 1000] {
        let registry = layered_registry(len, 4);
        let root = name(&format!("s{}", len - 1));
        group.bench_with_input(BenchmarkId::new("layered", len), &root, |b, root| {
            b.iter(|| resolve(black_box(&registry), black_box(root)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_resolve);
criterion_main!(benches);
