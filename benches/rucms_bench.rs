use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::runtime::Runtime;

use rucms::{
    Consistency, ContentEngine, EngineConfig, FieldMap, FilterMode, NamespaceDescriptor,
    NoopNotifier, Order, QueryOptions, TypeRegistry,
};

struct Fixture {
    _dir: TempDir,
    _runtime: Runtime,
    engine: ContentEngine,
}

fn fixture(records: usize) -> Fixture {
    let dir = TempDir::new().unwrap();
    let runtime = Runtime::new().unwrap();
    let _guard = runtime.enter();

    let registry = TypeRegistry::new().register(
        NamespaceDescriptor::new("Post")
            .with_field("title", json!(""))
            .with_field("category", json!("")),
    );
    let config = EngineConfig {
        data_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    let engine = ContentEngine::open(config, registry, Arc::new(NoopNotifier)).unwrap();

    for i in 0..records {
        engine
            .repository()
            .insert("Post", post(i), Consistency::Eventual)
            .unwrap();
    }
    drop(_guard);

    Fixture {
        _dir: dir,
        _runtime: runtime,
        engine,
    }
}

fn post(i: usize) -> FieldMap {
    let mut fields = FieldMap::new();
    fields.set("title", format!("Post number {}", i));
    fields.set("category", if i % 2 == 0 { "even" } else { "odd" });
    fields
}

// ============================================================================
// Benchmark: Insert
// ============================================================================

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");
    group.measurement_time(Duration::from_secs(10));

    let fixture = fixture(0);
    let _guard = fixture._runtime.enter();
    let repo = fixture.engine.repository();

    // Same title every time: exercises slug probing as the suffix grows
    group.bench_function("insert_duplicate_slug", |b| {
        b.iter(|| repo.insert("Post", black_box(post(0)), Consistency::Eventual).unwrap())
    });

    group.bench_function("insert_unique_slug", |b| {
        let mut counter = 1_000_000;
        b.iter(|| {
            counter += 1;
            repo.insert("Post", black_box(post(counter)), Consistency::Eventual).unwrap()
        })
    });

    group.finish();
}

// ============================================================================
// Benchmark: Queries
// ============================================================================

fn bench_queries(c: &mut Criterion) {
    let mut group = c.benchmark_group("queries");
    group.measurement_time(Duration::from_secs(10));

    for size in [100usize, 1000, 10000].iter() {
        let fixture = fixture(*size);
        let query = fixture.engine.query();
        group.throughput(Throughput::Elements(*size as u64));

        group.bench_with_input(BenchmarkId::new("paginate_last_page", size), size, |b, &size| {
            let opts = QueryOptions {
                count: 10,
                offset: (size / 10) as i64 - 1,
                order: Order::Desc,
            };
            b.iter(|| query.paginate("Post", black_box(&opts)).unwrap())
        });

        group.bench_with_input(BenchmarkId::new("filter_legacy", size), size, |b, _| {
            let opts = QueryOptions::default();
            b.iter(|| {
                query
                    .filter_by_field_value("Post", "category", "odd", &opts, FilterMode::Legacy)
                    .unwrap()
            })
        });

        group.bench_with_input(BenchmarkId::new("filter_structural", size), size, |b, _| {
            let opts = QueryOptions::default();
            b.iter(|| {
                query
                    .filter_by_field_value("Post", "category", "odd", &opts, FilterMode::Structural)
                    .unwrap()
            })
        });

        group.bench_with_input(BenchmarkId::new("substring_search", size), size, |b, _| {
            b.iter(|| query.substring_search("Post", black_box("number 5"), true).unwrap())
        });

        group.bench_with_input(BenchmarkId::new("sorted_rebuild", size), size, |b, _| {
            let maintainer = fixture.engine.maintainer();
            let ns = rucms::Namespace::primary("Post");
            b.iter(|| maintainer.rebuild(&ns).unwrap())
        });
    }

    group.finish();
}

criterion_group!(benches, bench_insert, bench_queries);
criterion_main!(benches);
