//! End-to-end tests over a loopback cluster: task submission, fan-out
//! distribution across workers and the statistics surface.


use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use taskmesh::error::MeshError;
use taskmesh::gateway::RemoteRegistry;
use taskmesh::rpc::{login, SessionRole};
use test_harness::TestCluster;

#[tokio::test]
async fn echo_task_round_trip() {
    let cluster = TestCluster::new(1).await;
    let client = cluster.client().await;

    let args = json!({ "hello": "world", "n": 7 });
    let task_id = cluster.submit(&client, "demo.echo", args.clone()).await;
    let status = cluster
        .wait_complete(&client, task_id, Duration::from_secs(10))
        .await;

    assert_eq!(status["results"], args);
    assert_eq!(status["status"], "complete");
    assert!(status["worker"].is_string());
}

#[tokio::test]
async fn fanout_distributes_across_workers_and_merges() {
    let cluster = TestCluster::new(3).await;
    let client = cluster.client().await;

    let items = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
    let task_id = cluster
        .submit(&client, "demo.fanout", json!({ "items": items }))
        .await;
    let status = cluster
        .wait_complete(&client, task_id, Duration::from_secs(20))
        .await;

    for (index, value) in items.iter().enumerate() {
        assert_eq!(
            status["results"][index.to_string()],
            json!(value * 2.0),
            "item {index} missing or wrong in {status}"
        );
    }
}

#[tokio::test]
async fn statistics_reflect_completed_work() {
    let cluster = TestCluster::new(2).await;
    let client = cluster.client().await;

    let task_id = cluster
        .submit(&client, "demo.fanout", json!({ "items": [1.0, 2.0, 3.0] }))
        .await;
    cluster
        .wait_complete(&client, task_id, Duration::from_secs(20))
        .await;

    // completions reach the statistics engine asynchronously
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let stats = client
            .call("task_statistics", json!({ "task_key": "demo.fanout" }))
            .await
            .expect("task_statistics");
        let completed = stats["stats"]["num_completed"].as_u64().unwrap_or(0);
        let sub_completed = stats["subtasks"]["double"]["num_completed"]
            .as_u64()
            .unwrap_or(0);
        if completed >= 1 && sub_completed >= 1 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "statistics never caught up: {stats}"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn single_worker_runs_tasks_back_to_back() {
    let cluster = TestCluster::new(1).await;
    let client = cluster.client().await;

    let first = cluster.submit(&client, "demo.echo", json!({ "n": 1 })).await;
    let second = cluster.submit(&client, "demo.echo", json!({ "n": 2 })).await;

    let a = cluster
        .wait_complete(&client, first, Duration::from_secs(15))
        .await;
    let b = cluster
        .wait_complete(&client, second, Duration::from_secs(15))
        .await;
    assert_eq!(a["results"], json!({ "n": 1 }));
    assert_eq!(b["results"], json!({ "n": 2 }));
}

#[tokio::test]
async fn bad_secret_is_rejected_at_login() {
    let cluster = TestCluster::new(0).await;
    let denied = login(
        &cluster.addr,
        "intruder",
        "wrong-secret",
        SessionRole::Client,
        Arc::new(RemoteRegistry::new()),
        Duration::from_secs(5),
    )
    .await;
    assert!(matches!(denied, Err(MeshError::LoginRejected)));
}

#[tokio::test]
async fn unknown_task_id_is_an_error() {
    let cluster = TestCluster::new(0).await;
    let client = cluster.client().await;
    let missing = client
        .call("task_status", json!({ "task_id": uuid::Uuid::new_v4() }))
        .await;
    assert!(matches!(missing, Err(MeshError::TaskNotFound(_))));
}
