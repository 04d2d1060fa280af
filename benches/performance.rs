//! Performance benchmarks for snapshot ingestion.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use session_dedup::{build_fingerprint, EngineConfig, SessionEngine, SessionSnapshot};
use tempfile::TempDir;

fn create_engine(dir: &TempDir) -> SessionEngine {
    SessionEngine::open(EngineConfig {
        path: dir.path().join("sessions"),
        cache_size: 1000,
        ..Default::default()
    })
    .unwrap()
}

fn snapshot(user: usize, storage_keys: usize, cookie: usize) -> SessionSnapshot {
    let local: serde_json::Map<String, serde_json::Value> = (0..storage_keys)
        .map(|i| (format!("key_{i}"), json!(format!("value-{i}"))))
        .collect();
    serde_json::from_value(json!({
        "userId": format!("user-{user}"),
        "timestamp": "2024-05-01T10:00:00Z",
        "userInfo": {"name": "bench", "plan": "pro"},
        "localStorage": local,
        "sessionStorage": {"step": "1"},
        "metadata": {"source": "bench"},
        "cookies": [{"name": "sid", "value": cookie}]
    }))
    .unwrap()
}

/// Benchmark fingerprinting with varying storage sizes
fn bench_fingerprint(c: &mut Criterion) {
    let mut group = c.benchmark_group("fingerprint");

    for keys in [10, 100, 1000] {
        let snap = snapshot(0, keys, 0);
        group.bench_with_input(BenchmarkId::new("storage_keys", keys), &snap, |b, snap| {
            b.iter(|| black_box(build_fingerprint(snap)));
        });
    }

    group.finish();
}

/// Benchmark the merge path: the same session re-captured with new cookies
fn bench_merge_ingest(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let engine = create_engine(&dir);
    engine.process_snapshot(snapshot(0, 50, 0)).unwrap();

    let mut cookie = 0;
    c.bench_function("process_snapshot_merge", |b| {
        b.iter(|| {
            cookie += 1;
            black_box(engine.process_snapshot(snapshot(0, 50, cookie)).unwrap());
        });
    });
}

/// Benchmark the create path across many users
fn bench_create_ingest(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let engine = create_engine(&dir);

    let mut user = 0;
    c.bench_function("process_snapshot_create", |b| {
        b.iter(|| {
            user += 1;
            black_box(engine.process_snapshot(snapshot(user, 50, 0)).unwrap());
        });
    });
}

criterion_group!(benches, bench_fingerprint, bench_merge_ingest, bench_create_ingest);
criterion_main!(benches);
