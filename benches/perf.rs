use criterion::{Criterion, black_box, criterion_group, criterion_main};
use flowctx::config::ContextConfig;
use flowctx::path::{PathExpr, ValueTree};
use flowctx::quota::{PathMutation, QuotaAccountant};
use flowctx::storage::{Mutation, PageRequest};
use flowctx::{ContextService, Tenant};
use serde_json::json;
use tempfile::tempdir;
use tokio::runtime::Runtime;

const PROJECT_ID: &str = "p";
const SEEDED_KEYS: usize = 1_000;
const BATCH_KEYS: usize = 64;

fn seeded_tree() -> ValueTree {
    let mut tree = ValueTree::new();
    for i in 0..SEEDED_KEYS {
        tree.insert(
            format!("key-{i}"),
            json!({"count": i, "label": "bench-value", "nested": {"flag": true}}),
        );
    }
    tree
}

async fn seed(service: &ContextService, tenant: &Tenant) {
    for scope in ["global", "flow-1", "node-1:flow-1"] {
        service
            .import_bulk(tenant, scope, seeded_tree())
            .await
            .expect("seed scope");
    }
}

fn bench_path_and_quota(c: &mut Criterion) {
    let tree = seeded_tree();
    let path = PathExpr::parse("key-500.nested.flag").expect("path");
    c.bench_function("path_get_nested", |b| {
        b.iter(|| black_box(path.get(black_box(&tree))))
    });

    let quota = QuotaAccountant::new(Some(10_000_000));
    let batch: Vec<PathMutation> = (0..BATCH_KEYS)
        .map(|i| {
            PathMutation::set(
                PathExpr::parse(&format!("key-{i}.nested.flag")).expect("path"),
                json!(false),
            )
        })
        .collect();
    c.bench_function("quota_evaluate_64_nested_writes", |b| {
        b.iter(|| black_box(quota.evaluate(100_000, black_box(&tree), &batch)))
    });
}

fn bench_service_hot_paths(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let tenant = Tenant::new(PROJECT_ID);

    let memory = ContextService::open(ContextConfig::development()).expect("memory");
    rt.block_on(seed(&memory, &tenant));

    let dir = tempdir().expect("temp");
    let sqlite = ContextService::open(ContextConfig::sqlite(dir.path().join("bench.db")))
        .expect("sqlite");
    rt.block_on(seed(&sqlite, &tenant));

    for (name, service) in [("memory", &memory), ("sqlite", &sqlite)] {
        let mut next = 0usize;
        c.bench_function(&format!("{name}_set_single_key"), |b| {
            b.iter(|| {
                rt.block_on(async {
                    let i = black_box(next);
                    next = (next + 1) % SEEDED_KEYS;
                    service
                        .set(
                            &tenant,
                            "flow-1",
                            vec![Mutation::set(format!("key-{i}.count"), json!(i))],
                        )
                        .await
                        .expect("set");
                })
            })
        });

        let keys: Vec<String> = (0..BATCH_KEYS).map(|i| format!("key-{i}.label")).collect();
        c.bench_function(&format!("{name}_get_64_keys"), |b| {
            b.iter(|| {
                rt.block_on(async {
                    black_box(service.get(&tenant, "global", &keys).await.expect("get"));
                })
            })
        });
    }

    c.bench_function("sqlite_export_page_of_3", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(
                    sqlite
                        .export_page(&tenant, PageRequest::new(3))
                        .await
                        .expect("export"),
                );
            })
        })
    });
}

criterion_group!(benches, bench_path_and_quota, bench_service_hot_paths);
criterion_main!(benches);
