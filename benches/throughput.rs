use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use tempfile::TempDir;

use chronolog::{config::EngineConfig, core::store::Store};

fn seeded(tmp: &TempDir, n: u64) -> Store {
    let store = Store::open(tmp.path().join("bench.log"), EngineConfig::default()).expect("open");
    for i in 0..n {
        store
            .insert("users", format!("u{}", i % 1_000), format!(r#"{{"qty":{i}}}"#))
            .expect("insert");
    }
    store
}

fn bench_appends(c: &mut Criterion) {
    c.bench_function("append_1k_synced", |b| {
        b.iter(|| {
            let tmp = TempDir::new().expect("tmp");
            let store = Store::open(tmp.path().join("bench.log"), EngineConfig::default()).expect("open");
            for i in 0..1_000u64 {
                let _ = store.insert("users", format!("u{i}"), "{}").expect("insert");
            }
        });
    });
}

fn bench_point_as_of(c: &mut Criterion) {
    let tmp = TempDir::new().expect("tmp");
    let store = seeded(&tmp, 20_000);
    let mut group = c.benchmark_group("point_as_of");

    for bound in [1_000u64, 10_000, 20_000] {
        group.bench_with_input(BenchmarkId::from_parameter(bound), &bound, |b, &bound| {
            b.iter(|| {
                let _ = store.state_as_of("users", "u7", bound, false).expect("as of");
            });
        });
    }

    group.finish();
}

fn bench_table_as_of(c: &mut Criterion) {
    let tmp = TempDir::new().expect("tmp");
    let store = seeded(&tmp, 20_000);
    let mut group = c.benchmark_group("table_as_of");
    group.sample_size(20);

    for bound in [10_000u64, 20_000] {
        group.bench_with_input(BenchmarkId::from_parameter(bound), &bound, |b, &bound| {
            b.iter(|| {
                let _ = store.table_as_of("users", bound, false).expect("table as of");
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_appends, bench_point_as_of, bench_table_as_of);
criterion_main!(benches);
