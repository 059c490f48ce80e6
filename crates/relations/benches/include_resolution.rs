//! Include Resolution Performance Benchmarks
//!
//! Measures batched include resolution over the in-memory connector as the
//! number of parent records grows

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use elif_relations::{
    DataSource, Filter, IdentityMap, MemoryConnector, ModelDefinition, RelationParams,
};
use serde_json::{json, Value};
use tokio::runtime::Runtime;

fn generate_blog(users: usize, posts_per_user: usize) -> DataSource {
    let connector = Arc::new(MemoryConnector::new());
    let source = DataSource::new(connector.clone());
    for model in ["User", "Post", "Comment"] {
        source.define_model(ModelDefinition::new(model)).unwrap();
    }
    source
        .define_relation("User", "posts", RelationParams::has_many("Post"))
        .unwrap();
    source
        .define_relation("Post", "user", RelationParams::belongs_to("User"))
        .unwrap();
    source
        .define_relation("Post", "comments", RelationParams::has_many("Comment"))
        .unwrap();

    connector
        .seed("User", (1..=users).map(|id| json!({ "id": id, "name": format!("User_{}", id) })))
        .unwrap();
    connector
        .seed(
            "Post",
            (1..=users * posts_per_user).map(|id| json!({ "id": id, "userId": (id - 1) / posts_per_user + 1 })),
        )
        .unwrap();
    connector
        .seed(
            "Comment",
            (1..=users * posts_per_user).map(|id| json!({ "id": id, "postId": id })),
        )
        .unwrap();
    source
}

fn bench_has_many_include(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("has_many_include");

    for user_count in [10, 100, 1000] {
        let source = &generate_blog(user_count, 3);
        let filter = &Filter::new().include("posts");
        group.bench_with_input(BenchmarkId::new("posts", user_count), &user_count, |b, _| {
            b.to_async(&rt).iter(|| async move {
                let users = source.find("User", filter).await.unwrap();
                black_box(users)
            })
        });
    }

    group.finish();
}

fn bench_nested_include(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("nested_include");

    for user_count in [10, 100, 1000] {
        let source = &generate_blog(user_count, 3);
        let filter = &Filter::new().include(json!({ "posts": ["comments", "user"] }));
        group.bench_with_input(
            BenchmarkId::new("posts_comments_user", user_count),
            &user_count,
            |b, _| {
                b.to_async(&rt).iter(|| async move {
                    let users = source.find("User", filter).await.unwrap();
                    black_box(users)
                })
            },
        );
    }

    group.finish();
}

fn bench_identity_map(c: &mut Criterion) {
    let mut group = c.benchmark_group("identity_map");

    for size in [100, 1000, 10000] {
        let keys: Vec<Value> = (0..size).map(|i| json!(i % (size / 2))).collect();
        group.bench_with_input(BenchmarkId::new("push", size), &keys, |b, keys| {
            b.iter(|| {
                let mut map: IdentityMap<Value, Vec<usize>> = IdentityMap::with_capacity(keys.len());
                for (i, key) in keys.iter().enumerate() {
                    map.push(key.clone(), i);
                }
                black_box(map)
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_has_many_include,
    bench_nested_include,
    bench_identity_map
);
criterion_main!(benches);
