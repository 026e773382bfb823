//! Performance benchmarks for the sync engine.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::{json, Value};
use std::sync::Arc;
use statesync::config::QueueConfig;
use statesync::filter::{filter_items, Comparison};
use statesync::queue::{RequestAssociation, RequestOperation};
use statesync::{
    ApiRequest, ApiResponse, FilterSpec, HttpMethod, LocalDatabase, MockTransport, QueueClass,
    RequestQueue, SecurityContext, StoreSchema,
};
use tempfile::TempDir;

fn records(count: usize) -> Vec<Value> {
    (0..count)
        .map(|i| {
            json!({
                "_id": format!("r{i}"),
                "status": ["open", "done", "blocked"][i % 3],
                "title": format!("Record number {i}"),
                "priority": i % 10,
            })
        })
        .collect()
}

/// Benchmark filter evaluation across collection sizes
fn bench_filter(c: &mut Criterion) {
    let mut group = c.benchmark_group("filter");
    let spec = FilterSpec::new()
        .exact("status", vec![json!("open"), json!("blocked")])
        .contains(vec!["title".to_string()], "number 1")
        .condition("priority", Comparison::GreaterThanOrEqual, json!(5));

    for size in [100, 1_000, 10_000] {
        let items = records(size);
        group.bench_with_input(BenchmarkId::new("records", size), &items, |b, items| {
            b.iter(|| black_box(filter_items(items, &spec)));
        });
    }

    group.finish();
}

/// Benchmark draining a queue whose transport answers synchronously
fn bench_queue_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_drain");

    for batch in [10, 100, 1_000] {
        group.bench_with_input(BenchmarkId::new("requests", batch), &batch, |b, &batch| {
            let transport = MockTransport::new();
            let security = Arc::new(SecurityContext::new(true));
            let config = QueueConfig {
                requires_token: true,
                ..Default::default()
            };
            let queue = RequestQueue::new(config, Arc::clone(&security), Arc::new(transport.clone()), None);

            b.iter(|| {
                security.clear_token();
                for i in 0..batch {
                    let class = if i % 2 == 0 {
                        QueueClass::Priority
                    } else {
                        QueueClass::Background
                    };
                    queue.add_request(
                        ApiRequest::new(HttpMethod::Get, format!("/items/{i}")),
                        RequestAssociation::new("bench", "items", RequestOperation::FetchItem),
                        class,
                    );
                }
                security.set_token("tok");
                black_box(transport.respond_all(|_| ApiResponse::new(204, "")));
                transport.reset();
            });
        });
    }

    group.finish();
}

/// Benchmark replacing a whole object store in one transaction
fn bench_bulk_replace(c: &mut Criterion) {
    let mut group = c.benchmark_group("bulk_replace");
    group.sample_size(20);

    for size in [100, 1_000] {
        let items = records(size);
        group.bench_with_input(BenchmarkId::new("records", size), &items, |b, items| {
            let dir = TempDir::new().unwrap();
            let db = LocalDatabase::open(dir.path(), "bench", vec![StoreSchema::keyed_by_id("items")])
                .unwrap();
            b.iter(|| {
                db.replace_all("items", items.clone()).unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_filter, bench_queue_drain, bench_bulk_replace);
criterion_main!(benches);
