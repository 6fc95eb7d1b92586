//! Tests for the streaming statistics engine: bucket aggregates, replay
//! cursors and query narrowing.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use taskmesh::master::ArchiveStore;
use taskmesh::stats::{
    run_engine, CompletedJob, CompletedJobSource, StatsQuery, StatsRegistry,
};

fn record(seq: u64, subtask: Option<&str>, worker: &str, secs: i64) -> CompletedJob {
    let started = Utc::now();
    CompletedJob {
        seq,
        task_key: "demo.fanout".to_string(),
        subtask_key: subtask.map(String::from),
        worker: worker.to_string(),
        version: "1.0".to_string(),
        started,
        completed: started + chrono::Duration::seconds(secs),
    }
}

fn task_query(task: &str) -> StatsQuery {
    StatsQuery {
        task_key: Some(task.to_string()),
        ..Default::default()
    }
}

#[test]
fn aggregates_match_a_known_distribution() {
    let mut registry = StatsRegistry::new();
    for (seq, secs) in [(1, 4), (2, 7), (3, 13), (4, 16)] {
        assert!(registry.update(&record(seq, None, "w1", secs)));
    }
    let summary = registry.query(&task_query("demo.fanout"));
    assert_eq!(summary["stats"]["num_completed"], json!(4));
    assert_eq!(summary["stats"]["mean"], json!(10.0));
    assert_eq!(summary["stats"]["variance"], json!(30.0));
    assert_eq!(summary["stats"]["min"], json!(4.0));
    assert_eq!(summary["stats"]["max"], json!(16.0));
    assert_eq!(summary["stats"]["summed_time"], json!(40.0));
}

#[test]
fn replayed_records_are_counted_once() {
    let mut registry = StatsRegistry::new();
    let r = record(1, None, "w1", 5);
    assert!(registry.update(&r));
    assert!(!registry.update(&r));
    assert!(!registry.update(&record(1, None, "w1", 9)));

    let summary = registry.query(&task_query("demo.fanout"));
    assert_eq!(summary["stats"]["num_completed"], json!(1));
    assert_eq!(summary["stats"]["summed_time"], json!(5.0));
}

#[test]
fn completion_before_start_is_rejected() {
    let mut registry = StatsRegistry::new();
    assert!(!registry.update(&record(1, None, "w1", -3)));
    let summary = registry.query(&task_query("demo.fanout"));
    assert_eq!(summary["stats"]["num_completed"], json!(0));

    // the cursor still advanced past the bad record
    assert!(!registry.update(&record(1, None, "w1", 3)));
    assert!(registry.update(&record(2, None, "w1", 3)));
}

#[test]
fn buckets_split_by_subtask_worker_and_version() {
    let mut registry = StatsRegistry::new();
    registry.update(&record(1, None, "w1", 10));
    registry.update(&record(2, Some("double"), "w2", 4));
    registry.update(&record(3, Some("double"), "w2", 6));

    let summary = registry.query(&task_query("demo.fanout"));
    assert_eq!(summary["stats"]["num_completed"], json!(3));
    assert_eq!(summary["subtasks"]["double"]["num_completed"], json!(2));
    assert_eq!(summary["subtasks"]["double"]["mean"], json!(5.0));
    assert_eq!(summary["workers"]["w1"]["num_completed"], json!(1));
    assert_eq!(summary["workers"]["w2"]["num_completed"], json!(2));
    assert_eq!(summary["versions"]["1.0"]["num_completed"], json!(3));

    let narrowed = registry.query(&StatsQuery {
        task_key: Some("demo.fanout".to_string()),
        worker: Some("w2".to_string()),
        ..Default::default()
    });
    assert_eq!(narrowed["num_completed"], json!(2));
}

#[test]
fn unknown_keys_yield_empty_objects() {
    let mut registry = StatsRegistry::new();
    registry.update(&record(1, None, "w1", 5));

    assert_eq!(registry.query(&task_query("no.such.task")), json!({}));
    let unknown_worker = registry.query(&StatsQuery {
        task_key: Some("demo.fanout".to_string()),
        worker: Some("w9".to_string()),
        ..Default::default()
    });
    assert_eq!(unknown_worker, json!({}));
}

#[test]
fn no_task_key_returns_every_task() {
    let mut registry = StatsRegistry::new();
    registry.update(&record(1, None, "w1", 5));
    let mut other = record(2, None, "w1", 7);
    other.task_key = "demo.echo".to_string();
    registry.update(&other);

    let all = registry.query(&StatsQuery::default());
    assert_eq!(all["demo.fanout"]["stats"]["num_completed"], json!(1));
    assert_eq!(all["demo.echo"]["stats"]["num_completed"], json!(1));
}

/// The push path and the periodic archive scan observe the same record;
/// the cursor makes sure it is only folded in once.
#[tokio::test]
async fn engine_does_not_double_count_archived_records() {
    let registry = Arc::new(RwLock::new(StatsRegistry::new()));
    let (tx, rx) = mpsc::unbounded_channel();
    let archive = Arc::new(ArchiveStore::new(tx));
    let shutdown = CancellationToken::new();

    let started = Utc::now();
    archive.push(
        "demo.echo",
        None,
        "w1",
        "1.0",
        started,
        started + chrono::Duration::seconds(5),
    );

    let engine = tokio::spawn(run_engine(
        registry.clone(),
        rx,
        archive.clone() as Arc<dyn CompletedJobSource>,
        Duration::from_millis(20),
        shutdown.clone(),
    ));
    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown.cancel();
    engine.await.expect("engine task");

    let summary = registry
        .read()
        .expect("lock poisoned")
        .query(&task_query("demo.echo"));
    assert_eq!(summary["stats"]["num_completed"], json!(1));
    assert_eq!(summary["stats"]["summed_time"], json!(5.0));
}

/// Sub-unit completions recorded from concurrent sessions must all land
/// in the aggregate. A record arriving after a higher sequence number
/// would be skipped by the cursor, so the archive has to hand them to
/// the engine in the order it numbered them.
#[tokio::test(flavor = "multi_thread")]
async fn concurrent_completions_are_all_accounted() {
    let registry = Arc::new(RwLock::new(StatsRegistry::new()));
    let (tx, rx) = mpsc::unbounded_channel();
    let archive = Arc::new(ArchiveStore::new(tx));
    let shutdown = CancellationToken::new();

    let engine = tokio::spawn(run_engine(
        registry.clone(),
        rx,
        archive.clone() as Arc<dyn CompletedJobSource>,
        Duration::from_millis(20),
        shutdown.clone(),
    ));

    let started = Utc::now();
    let completed = started + chrono::Duration::seconds(3);
    let mut handles = Vec::new();
    for i in 0..32 {
        let archive = archive.clone();
        handles.push(tokio::spawn(async move {
            let worker = format!("w{}", i % 4);
            archive.push(
                "demo.fanout",
                Some("double".to_string()),
                &worker,
                "1.0",
                started,
                completed,
            );
        }));
    }
    for h in handles {
        h.await.expect("push task");
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    shutdown.cancel();
    engine.await.expect("engine task");

    let summary = registry
        .read()
        .expect("lock poisoned")
        .query(&task_query("demo.fanout"));
    assert_eq!(summary["stats"]["num_completed"], json!(32));
    assert_eq!(summary["subtasks"]["double"]["num_completed"], json!(32));
}
