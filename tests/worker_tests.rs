//! Tests for the worker runtime: the reconnect backoff schedule, the
//! single-task busy gate and result retention without a master.

use std::time::Duration;

use serde_json::{json, Value};

use taskmesh::config::WorkerConfig;
use taskmesh::error::MeshError;
use taskmesh::rpc::proto::RunTaskArgs;
use taskmesh::worker::{reconnect_delay, WorkerRuntime, WorkerStatus};

fn echo_args() -> RunTaskArgs {
    RunTaskArgs {
        key: "demo.echo".to_string(),
        args: json!({ "payload": 42 }),
        subtask_key: None,
        workunit_key: None,
        available_workers: 1,
    }
}

#[test]
fn reconnect_backoff_schedule() {
    let delays: Vec<u64> = (0..8).map(|n| reconnect_delay(n).as_secs()).collect();
    assert_eq!(delays, vec![5, 10, 20, 40, 80, 160, 160, 160]);
}

#[tokio::test]
async fn unknown_task_errors_without_blocking_the_worker() {
    let runtime = WorkerRuntime::new(WorkerConfig::default());
    let args = RunTaskArgs {
        key: "no.such.task".to_string(),
        args: Value::Null,
        subtask_key: None,
        workunit_key: None,
        available_workers: 1,
    };
    assert!(matches!(
        runtime.run_task(args),
        Err(MeshError::TaskNotFound(_))
    ));
    assert_eq!(runtime.status(), WorkerStatus::Idle);
    // the worker still accepts real work afterwards
    runtime.run_task(echo_args()).expect("echo accepted");
}

#[tokio::test]
async fn results_are_held_until_a_master_takes_them() {
    let runtime = WorkerRuntime::new(WorkerConfig::default());
    runtime.run_task(echo_args()).expect("echo accepted");

    // echo finishes immediately; with no master connected the results
    // have nowhere to go
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while runtime.status() == WorkerStatus::Working {
        assert!(tokio::time::Instant::now() < deadline, "task never finished");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(runtime.status(), WorkerStatus::Finished);

    // held results keep the busy gate shut
    assert!(matches!(
        runtime.run_task(echo_args()),
        Err(MeshError::WorkerBusy(_))
    ));
}

#[tokio::test]
async fn working_worker_rejects_a_second_task() {
    let runtime = WorkerRuntime::new(WorkerConfig::default());
    // a root fanout run blocks waiting for sub-results that never arrive
    let blocking = RunTaskArgs {
        key: "demo.fanout".to_string(),
        args: json!({ "items": [1.0, 2.0] }),
        subtask_key: None,
        workunit_key: None,
        available_workers: 1,
    };
    runtime.run_task(blocking).expect("fanout accepted");
    assert_eq!(runtime.status(), WorkerStatus::Working);
    assert!(matches!(
        runtime.run_task(echo_args()),
        Err(MeshError::WorkerBusy(_))
    ));
}
