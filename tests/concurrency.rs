//! Concurrent ingestion and cleanup.

use chrono::{Duration, SecondsFormat, Utc};
use serde_json::json;
use session_dedup::{
    EngineConfig, MemorySnapshotStore, ProcessAction, SessionEngine, SessionSnapshot,
};
use std::sync::{Arc, Barrier};
use std::thread;

fn engine(config: EngineConfig) -> Arc<SessionEngine> {
    Arc::new(SessionEngine::with_store(config, Arc::new(MemorySnapshotStore::new())).unwrap())
}

fn snapshot(user: &str, minutes_ago: i64, cookie: usize) -> SessionSnapshot {
    let ts = (Utc::now() - Duration::minutes(minutes_ago)).to_rfc3339_opts(SecondsFormat::Micros, true);
    serde_json::from_value(json!({
        "userId": user,
        "timestamp": ts,
        "userInfo": {"name": user},
        "localStorage": {"theme": "dark"},
        "cookies": [{"name": "sid", "value": cookie}]
    }))
    .unwrap()
}

#[test]
fn test_same_user_racing_creates_once() {
    let engine = engine(EngineConfig::default());
    let threads = 16;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                engine.process_snapshot(snapshot("shared", 10, i)).unwrap()
            })
        })
        .collect();

    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let created = outcomes
        .iter()
        .filter(|o| o.action == ProcessAction::Created)
        .count();
    let merged = outcomes
        .iter()
        .filter(|o| o.action == ProcessAction::Merged)
        .count();
    assert_eq!(created, 1);
    assert_eq!(merged, threads - 1);

    let records = engine.records_for("shared");
    assert_eq!(records.len(), 1);
    let stored = engine.load_snapshot(&records[0].key).unwrap().unwrap();
    assert_eq!(stored.metadata["mergeCount"], (threads - 1) as u64);
}

#[test]
fn test_many_users_in_parallel() {
    let engine = engine(EngineConfig::default());

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for round in 0..20 {
                    let user = format!("user-{t}");
                    engine.process_snapshot(snapshot(&user, 30, round)).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = engine.stats();
    assert_eq!(stats.total_users, 8);
    assert_eq!(stats.total_sessions, 8);
}

#[test]
fn test_cleanup_racing_ingestion_keeps_fresh_records() {
    let engine = engine(EngineConfig {
        retention_days: 1,
        max_total_sessions: 0,
        ..Default::default()
    });

    // Stale records that the sweeps should remove.
    for i in 0..20 {
        let user = format!("stale-{i}");
        engine
            .process_snapshot(snapshot(&user, 60 * 24 * 3, i))
            .unwrap();
    }

    let writer = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            for i in 0..50 {
                let user = format!("fresh-{i}");
                engine.process_snapshot(snapshot(&user, 1, i)).unwrap();
            }
        })
    };
    let sweeper = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || (0..10).map(|_| engine.run_cleanup().removed_records).sum::<u64>())
    };

    writer.join().unwrap();
    let removed = sweeper.join().unwrap() + engine.run_cleanup().removed_records;

    assert_eq!(removed, 20);
    let stats = engine.stats();
    assert_eq!(stats.total_sessions, 50);
    assert_eq!(stats.total_users, 50);
}
