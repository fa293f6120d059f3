use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use kyro_assoc::{
    AssociationRegistry, AssociationSpec, CacheConfig, CacheKey, InMemoryDataSource, Provenance, Query, QueryBuilder,
    QueryCache, Record, SortDirection,
};

fn make_query() -> (Arc<AssociationRegistry>, Query) {
    let registry = Arc::new(AssociationRegistry::new());
    registry
        .register_association(AssociationSpec::new("loggable").table("audit_logs"))
        .unwrap();
    for kind in ["jobs", "tasks", "invoices", "payments"] {
        registry.add_target("loggable", kind, kind, Provenance::Manual).unwrap();
    }

    let source = Arc::new(InMemoryDataSource::new());
    // 512 rows spread across the four target kinds.
    for i in 0..512i64 {
        let kind = ["jobs", "tasks", "invoices", "payments"][usize::try_from(i % 4).unwrap()];
        source
            .insert(
                "audit_logs",
                Record::new()
                    .with("id", i)
                    .with("loggable_type", kind)
                    .with("loggable_id", i / 4)
                    .with("severity", i % 5),
            )
            .unwrap();
    }

    let query = QueryBuilder::new(Arc::clone(&registry), source, "loggable")
        .targets(["jobs", "tasks"])
        .range("severity", Some(1i64.into()), Some(3i64.into()))
        .order_by("id", SortDirection::Desc)
        .limit(50)
        .build()
        .unwrap();
    (registry, query)
}

fn bench_key_canonicalization(c: &mut Criterion) {
    let (_registry, query) = make_query();
    c.bench_function("cache/key_for_request", |b| {
        b.iter(|| CacheKey::for_request(black_box(query.request())).unwrap());
    });
}

fn bench_hit_path(c: &mut Criterion) {
    let (registry, query) = make_query();
    let cache = QueryCache::attach(CacheConfig::default().with_sweep_interval(None), &registry);
    cache.execute(&query).unwrap();

    let mut group = c.benchmark_group("cache");
    group.throughput(Throughput::Elements(1));
    group.bench_function("execute_hit", |b| {
        b.iter(|| cache.execute(black_box(&query)).unwrap());
    });
    group.bench_function("execute_uncached", |b| {
        b.iter(|| black_box(&query).execute().unwrap());
    });
    group.finish();
}

criterion_group!(cache, bench_key_canonicalization, bench_hit_path);
criterion_main!(cache);
