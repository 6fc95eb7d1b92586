//! Worker process runtime.
//!
//! Owns the connection to the master, the single-task busy gate and the
//! result retention needed to survive a dropped link. A worker runs at
//! most one task at a time; finished results that could not be delivered
//! are held and re-sent on the next successful connect, and the worker
//! keeps refusing new work until they are off its hands.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::{MeshError, Result};
use crate::gateway::RemoteRegistry;
use crate::rpc::proto::{ReceiveResultsArgs, RequestWorkerArgs, RunTaskArgs, SendResultsArgs};
use crate::rpc::{login, Peer, SessionRole};
use crate::worker::heartbeat::HeartbeatSender;
use crate::worker::tasks::{SubResult, TaskContext, TaskRegistry};

/// Reconnect backoff: 5s doubling per failed attempt, capped at 160s.
pub fn reconnect_delay(attempt: u32) -> Duration {
    Duration::from_secs(5 * 2u64.pow(attempt.min(5)))
}

/// Escalating reconnect schedule. Every failed attempt and every lost
/// connection doubles the next delay up to the cap; a successful connect
/// resets the schedule to its 5s start.
#[derive(Debug, Default)]
pub struct Backoff {
    attempt: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay to wait before the next connection attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = reconnect_delay(self.attempt);
        self.attempt = (self.attempt + 1).min(6);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// What a worker reports when asked for its status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// No task and no undelivered results.
    Idle,
    /// A task is running.
    Working,
    /// A task finished but its results have not reached the master yet.
    Finished,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Working => "working",
            WorkerStatus::Finished => "finished",
        }
    }
}

/// Bookkeeping for the task currently occupying the worker.
struct Running {
    task_key: String,
    subtask_key: Option<String>,
    workunit_key: Option<Value>,
    version: String,
    /// Present only for root runs, which may receive sub-results.
    subresults: Option<mpsc::UnboundedSender<SubResult>>,
}

pub struct WorkerRuntime {
    config: WorkerConfig,
    tasks: TaskRegistry,
    running: Mutex<Option<Running>>,
    /// Finished results awaiting delivery to the master.
    held: Mutex<Option<SendResultsArgs>>,
    link: Mutex<Option<Peer>>,
}

impl WorkerRuntime {
    pub fn new(config: WorkerConfig) -> Arc<Self> {
        Self::with_tasks(config, TaskRegistry::new())
    }

    pub fn with_tasks(config: WorkerConfig, tasks: TaskRegistry) -> Arc<Self> {
        Arc::new(Self {
            config,
            tasks,
            running: Mutex::new(None),
            held: Mutex::new(None),
            link: Mutex::new(None),
        })
    }

    pub fn worker_key(&self) -> &str {
        &self.config.worker_key
    }

    pub fn status(&self) -> WorkerStatus {
        if self.running.lock().expect("lock poisoned").is_some() {
            WorkerStatus::Working
        } else if self.held.lock().expect("lock poisoned").is_some() {
            WorkerStatus::Finished
        } else {
            WorkerStatus::Idle
        }
    }

    fn current_link(&self) -> Option<Peer> {
        self.link.lock().expect("lock poisoned").clone()
    }

    /// The methods this worker exposes to the master.
    pub fn remote_registry(self: &Arc<Self>) -> RemoteRegistry {
        let mut registry = RemoteRegistry::new();

        let rt = self.clone();
        registry.register("status", move |_caller, _args| {
            let rt = rt.clone();
            async move {
                let running = rt.running.lock().expect("lock poisoned");
                let held = rt.held.lock().expect("lock poisoned");
                let (status, task, subtask) = match (running.as_ref(), held.as_ref()) {
                    (Some(r), _) => (
                        WorkerStatus::Working,
                        Some(r.task_key.clone()),
                        r.subtask_key.clone(),
                    ),
                    (None, Some(h)) => (
                        WorkerStatus::Finished,
                        Some(h.task_key.clone()),
                        h.subtask_key.clone(),
                    ),
                    (None, None) => (WorkerStatus::Idle, None, None),
                };
                Ok(json!({
                    "status": status.as_str(),
                    "task": task,
                    "subtask": subtask,
                }))
            }
        });

        let rt = self.clone();
        registry.register("task_list", move |_caller, _args| {
            let rt = rt.clone();
            async move { Ok(rt.tasks.task_list()) }
        });

        let rt = self.clone();
        registry.register("run_task", move |_caller, args| {
            let rt = rt.clone();
            async move {
                let args: RunTaskArgs = serde_json::from_value(args)?;
                rt.run_task(args)
            }
        });

        let rt = self.clone();
        registry.register("receive_results", move |_caller, args| {
            let rt = rt.clone();
            async move {
                let args: ReceiveResultsArgs = serde_json::from_value(args)?;
                rt.receive_results(args);
                Ok(Value::Null)
            }
        });

        registry
    }

    /// Accept a task if idle. The task key is resolved before the busy
    /// gate, so an unknown key errors without wedging the worker. Returns
    /// as soon as the task is started; completion is reported through
    /// `send_results`.
    pub fn run_task(self: &Arc<Self>, args: RunTaskArgs) -> Result<Value> {
        let (task, version) = self.tasks.instantiate(&args.key)?;

        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let is_root = args.subtask_key.is_none();
        let (subresults_tx, subresults_rx) = if is_root {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        {
            let mut running = self.running.lock().expect("lock poisoned");
            if running.is_some() || self.held.lock().expect("lock poisoned").is_some() {
                return Err(MeshError::WorkerBusy(self.config.worker_key.clone()));
            }
            *running = Some(Running {
                task_key: args.key.clone(),
                subtask_key: args.subtask_key.clone(),
                workunit_key: args.workunit_key.clone(),
                version,
                subresults: subresults_tx,
            });
        }

        tracing::info!(
            worker = %self.config.worker_key,
            task = %args.key,
            subtask = args.subtask_key.as_deref(),
            "starting task"
        );

        let ctx = TaskContext::new(
            args.args,
            args.subtask_key,
            args.workunit_key,
            requests_tx,
            subresults_rx,
        );

        let rt = self.clone();
        tokio::spawn(async move {
            let forwarder = tokio::spawn({
                let rt = rt.clone();
                forward_requests(rt, requests_rx)
            });
            let outcome = task.run(ctx).await;
            forwarder.abort();
            rt.work_complete(outcome).await;
        });

        Ok(json!({ "started": true }))
    }

    /// Route sub-results from the master into the running root task.
    fn receive_results(&self, args: ReceiveResultsArgs) {
        let running = self.running.lock().expect("lock poisoned");
        let Some(tx) = running.as_ref().and_then(|r| r.subresults.as_ref()) else {
            tracing::warn!(
                worker = %self.config.worker_key,
                subtask = %args.subtask_key,
                "dropping sub-results, no root task is running"
            );
            return;
        };
        let _ = tx.send(SubResult {
            subtask_key: args.subtask_key,
            workunit_key: args.workunit_key,
            results: args.results,
        });
    }

    /// Called when the running task finishes. Reports results to the
    /// master; if delivery fails the payload is held and the worker stays
    /// busy until a later connect re-sends it.
    async fn work_complete(&self, outcome: Result<Value>) {
        let (results, success) = match outcome {
            Ok(results) => (results, true),
            Err(e) => {
                tracing::error!(
                    worker = %self.config.worker_key,
                    error = %e,
                    "task failed"
                );
                (json!({ "error": e.to_string() }), false)
            }
        };

        // The payload is parked under the running lock so the busy gate
        // never opens between task teardown and delivery.
        {
            let mut running = self.running.lock().expect("lock poisoned");
            let finished = running.take().expect("work_complete with no running task");
            *self.held.lock().expect("lock poisoned") = Some(SendResultsArgs {
                task_key: finished.task_key,
                subtask_key: finished.subtask_key,
                workunit_key: finished.workunit_key,
                results,
                success,
                version: finished.version,
            });
        }

        if let Some(peer) = self.current_link() {
            self.flush_held(&peer).await;
        } else {
            tracing::warn!(
                worker = %self.config.worker_key,
                "not connected, holding results for redelivery"
            );
        }
    }

    /// Try to deliver held results over `peer`. Kept on failure.
    async fn flush_held(&self, peer: &Peer) {
        let Some(payload) = self.held.lock().expect("lock poisoned").clone() else {
            return;
        };
        let args = match serde_json::to_value(&payload) {
            Ok(args) => args,
            Err(e) => {
                tracing::error!(error = %e, "dropping unencodable results payload");
                *self.held.lock().expect("lock poisoned") = None;
                return;
            }
        };
        match peer.call("send_results", args).await {
            Ok(_) => {
                *self.held.lock().expect("lock poisoned") = None;
                tracing::info!(
                    worker = %self.config.worker_key,
                    task = %payload.task_key,
                    "results delivered"
                );
            }
            Err(e) => {
                tracing::warn!(
                    worker = %self.config.worker_key,
                    task = %payload.task_key,
                    error = %e,
                    "result delivery failed, holding for redelivery"
                );
            }
        }
    }

    /// Connect-and-serve loop. Reconnects with exponential backoff until
    /// `shutdown` fires; each successful connect resets the backoff and
    /// re-sends any held results. A lost connection is retried on the
    /// same schedule as a failed one, starting at 5s.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let registry = Arc::new(self.remote_registry());
        let mut backoff = Backoff::new();

        loop {
            let connected = login(
                &self.config.master_addr,
                &self.config.worker_key,
                &self.config.secret,
                SessionRole::Worker,
                registry.clone(),
                Duration::from_millis(self.config.call_timeout_ms),
            )
            .await;

            let peer = match connected {
                Ok(peer) => peer,
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        master = %self.config.master_addr,
                        error = %e,
                        retry_in_secs = delay.as_secs(),
                        "connect failed"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            tracing::info!(
                master = %self.config.master_addr,
                worker = %self.config.worker_key,
                "connected"
            );
            backoff.reset();
            *self.link.lock().expect("lock poisoned") = Some(peer.clone());
            self.flush_held(&peer).await;

            let heartbeat = HeartbeatSender::new(
                self.config.heartbeat_interval_ms,
                &self.config.worker_key,
            );
            tokio::select! {
                _ = shutdown.cancelled() => {
                    *self.link.lock().expect("lock poisoned") = None;
                    return;
                }
                _ = heartbeat.run(peer.clone()) => {}
                _ = peer.wait_closed() => {}
            }

            *self.link.lock().expect("lock poisoned") = None;
            let delay = backoff.next_delay();
            tracing::warn!(
                master = %self.config.master_addr,
                retry_in_secs = delay.as_secs(),
                "connection lost"
            );
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Forward worker requests from the running task to the master.
async fn forward_requests(
    rt: Arc<WorkerRuntime>,
    mut rx: mpsc::UnboundedReceiver<crate::worker::tasks::WorkRequest>,
) {
    while let Some(request) = rx.recv().await {
        let args = RequestWorkerArgs {
            subtask_key: request.subtask_key,
            args: request.args,
            workunit_key: request.workunit_key,
            size: request.size,
        };
        let Some(peer) = rt.current_link() else {
            tracing::warn!("dropping worker request, not connected");
            continue;
        };
        let args = match serde_json::to_value(&args) {
            Ok(args) => args,
            Err(e) => {
                tracing::error!(error = %e, "unencodable worker request");
                continue;
            }
        };
        if let Err(e) = peer.notify("request_worker", args) {
            tracing::warn!(error = %e, "failed to send worker request");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let delays: Vec<u64> = (0..7).map(|n| reconnect_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 80, 160, 160]);
        // stays pinned at the cap
        assert_eq!(reconnect_delay(40).as_secs(), 160);
    }

    #[test]
    fn backoff_resets_to_five_after_success() {
        let mut backoff = Backoff::new();
        let escalated: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(escalated, vec![5, 10, 20, 40, 80, 160, 160, 160]);

        // a successful connect resets the schedule
        backoff.reset();
        assert_eq!(backoff.next_delay().as_secs(), 5);
        assert_eq!(backoff.next_delay().as_secs(), 10);
    }

    #[test]
    fn status_starts_idle() {
        let rt = WorkerRuntime::new(WorkerConfig::default());
        assert_eq!(rt.status(), WorkerStatus::Idle);
    }

    #[tokio::test]
    async fn busy_worker_refuses_second_task() {
        let rt = WorkerRuntime::new(WorkerConfig::default());
        // a root fanout run blocks waiting for sub-results
        let args = RunTaskArgs {
            key: "demo.fanout".to_string(),
            args: json!({ "items": [1.0] }),
            subtask_key: None,
            workunit_key: None,
            available_workers: 1,
        };
        rt.run_task(args.clone()).unwrap();
        assert_eq!(rt.status(), WorkerStatus::Working);
        assert!(matches!(rt.run_task(args), Err(MeshError::WorkerBusy(_))));
    }

    #[tokio::test]
    async fn unknown_task_does_not_trip_busy_gate() {
        let rt = WorkerRuntime::new(WorkerConfig::default());
        let args = RunTaskArgs {
            key: "no.such.task".to_string(),
            args: Value::Null,
            subtask_key: None,
            workunit_key: None,
            available_workers: 1,
        };
        assert!(matches!(rt.run_task(args), Err(MeshError::TaskNotFound(_))));
        assert_eq!(rt.status(), WorkerStatus::Idle);
    }
}
