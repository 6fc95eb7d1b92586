//! Master node: accepts worker and client sessions, owns the task tables,
//! distributes queued work and feeds the statistics engine.
//!
//! # Components
//!
//! - [`Master`] / [`BoundMaster`]: listener lifecycle and the accept loop
//! - [`node`]: registered-worker pool with heartbeat liveness
//! - the distribution loop: starts queued tasks on idle workers and drains
//!   each instance's request queue through the batch builder
//!
//! # Distribution flow
//!
//! 1. A client calls `submit_task`; the instance is queued
//! 2. The distribution loop assigns the root task to an idle worker
//! 3. The running task calls `request_worker`; requests queue per instance
//! 4. The loop coalesces requests into batches and farms them out
//! 5. Workers report through `send_results`; sub-results are routed back
//!    to the instance's main worker and completions feed the statistics
//!    engine

pub mod node;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::MasterConfig;
use crate::error::{MeshError, Result};
use crate::gateway::{RemoteRegistry, SessionGateway};
use crate::rpc::proto::{
    ReceiveResultsArgs, RequestWorkerArgs, RunTaskArgs, SendResultsArgs, SubmitTaskArgs,
    TaskStatusArgs,
};
use crate::rpc::wire::{self, Envelope, SessionRole};
use crate::rpc::Peer;
use crate::stats::{run_engine, CompletedJob, CompletedJobSource, StatsQuery, StatsRegistry};
use crate::work::{flatten_transmitable, Dispatch, JobStatus, QueueEntry, TaskInstance, WorkUnit};

use node::WorkerPool;

/// What a worker is currently doing, keyed by worker in the shared table.
#[derive(Debug, Clone, Copy)]
struct Assignment {
    instance: Uuid,
    /// True for the worker running the root task itself.
    main: bool,
}

/// A live task instance plus the sub-units currently out on workers,
/// keyed by workunit key.
struct TaskEntry {
    instance: TaskInstance,
    in_flight: HashMap<String, WorkUnit>,
}

impl TaskEntry {
    fn new(instance: TaskInstance) -> Self {
        Self {
            instance,
            in_flight: HashMap::new(),
        }
    }
}

/// Append-only record of completed jobs. Doubles as the catch-up source
/// for the statistics engine after a restart of its receive loop.
pub struct ArchiveStore {
    inner: Mutex<ArchiveInner>,
    stats_tx: mpsc::UnboundedSender<CompletedJob>,
}

struct ArchiveInner {
    next_seq: u64,
    records: Vec<CompletedJob>,
}

impl ArchiveStore {
    pub fn new(stats_tx: mpsc::UnboundedSender<CompletedJob>) -> Self {
        Self {
            inner: Mutex::new(ArchiveInner {
                next_seq: 1,
                records: Vec::new(),
            }),
            stats_tx,
        }
    }

    /// Record a completion, assigning it the next sequence number.
    ///
    /// The statistics channel send happens under the same lock that hands
    /// out the sequence number, so the engine receives records in strict
    /// `seq` order and its accounting cursor never skips one.
    pub fn push(
        &self,
        task_key: &str,
        subtask_key: Option<String>,
        worker: &str,
        version: &str,
        started: DateTime<Utc>,
        completed: DateTime<Utc>,
    ) -> CompletedJob {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let record = CompletedJob {
            seq,
            task_key: task_key.to_string(),
            subtask_key,
            worker: worker.to_string(),
            version: version.to_string(),
            started,
            completed,
        };
        inner.records.push(record.clone());
        // The periodic catch-up scan picks the record up if the receive
        // loop is gone.
        let _ = self.stats_tx.send(record.clone());
        record
    }
}

#[async_trait]
impl CompletedJobSource for ArchiveStore {
    async fn completed_since(&self, seq: u64) -> Vec<CompletedJob> {
        self.inner
            .lock()
            .expect("lock poisoned")
            .records
            .iter()
            .filter(|r| r.seq > seq)
            .cloned()
            .collect()
    }
}

struct MasterShared {
    config: MasterConfig,
    workers: Mutex<WorkerPool>,
    tasks: Mutex<HashMap<Uuid, TaskEntry>>,
    assignments: Mutex<HashMap<String, Assignment>>,
    stats: Arc<RwLock<StatsRegistry>>,
    archive: Arc<ArchiveStore>,
}

impl MasterShared {
    fn submit_task(&self, args: SubmitTaskArgs) -> Value {
        let instance = TaskInstance::new(args.task_key, args.args);
        let id = instance.id;
        tracing::info!(task = %instance.job.task_key, task_id = %id, "task queued");
        self.tasks
            .lock()
            .expect("lock poisoned")
            .insert(id, TaskEntry::new(instance));
        json!({ "task_id": id })
    }

    fn task_status(&self, args: TaskStatusArgs) -> Result<Value> {
        self.tasks
            .lock()
            .expect("lock poisoned")
            .get(&args.task_id)
            .map(|entry| entry.instance.summary())
            .ok_or_else(|| MeshError::TaskNotFound(args.task_id.to_string()))
    }

    fn list_tasks(&self) -> Value {
        let tasks = self.tasks.lock().expect("lock poisoned");
        let mut summaries: Vec<Value> =
            tasks.values().map(|entry| entry.instance.summary()).collect();
        summaries.sort_by_key(|s| s["queued"].to_string());
        Value::Array(summaries)
    }

    fn heartbeat(&self, caller: &str) {
        self.workers.lock().expect("lock poisoned").heartbeat(caller);
    }

    /// A running task asked for another worker. The request queues on its
    /// instance until the distribution loop can serve it.
    fn request_worker(&self, caller: &str, args: RequestWorkerArgs) -> Result<()> {
        let instance_id = self
            .assignments
            .lock()
            .expect("lock poisoned")
            .get(caller)
            .map(|a| a.instance)
            .ok_or_else(|| {
                MeshError::TaskNotFound(format!("no task assigned to worker {caller}"))
            })?;

        let tasks = self.tasks.lock().expect("lock poisoned");
        let entry = tasks
            .get(&instance_id)
            .ok_or_else(|| MeshError::TaskNotFound(instance_id.to_string()))?;
        let unit = WorkUnit::new(
            instance_id,
            &entry.instance.job.task_key,
            &args.subtask_key,
            args.args,
            args.workunit_key,
            args.size,
        );
        tracing::debug!(
            worker = caller,
            task = %entry.instance.job.task_key,
            subtask = %args.subtask_key,
            workunit = %unit.workunit,
            "worker request queued"
        );
        entry.instance.requests.enqueue(QueueEntry::Request(unit));
        Ok(())
    }

    /// A worker finished its task or sub-units.
    async fn send_results(&self, caller: &str, args: SendResultsArgs) -> Result<Value> {
        let now = Utc::now();
        let instance_id = self
            .assignments
            .lock()
            .expect("lock poisoned")
            .get(caller)
            .map(|a| a.instance)
            .ok_or_else(|| {
                MeshError::TaskNotFound(format!("no task assigned to worker {caller}"))
            })?;

        let Some(workunit_key) = args.workunit_key.clone() else {
            return self.complete_root(caller, instance_id, args, now);
        };

        let keys = flatten_transmitable(&workunit_key);
        let (main_worker, finished) = {
            let mut tasks = self.tasks.lock().expect("lock poisoned");
            let entry = tasks
                .get_mut(&instance_id)
                .ok_or_else(|| MeshError::TaskNotFound(instance_id.to_string()))?;

            let mut finished: Vec<(Option<String>, DateTime<Utc>)> = Vec::new();
            let mut failed: Vec<WorkUnit> = Vec::new();
            for key in &keys {
                let Some(mut unit) = entry.in_flight.remove(key) else {
                    tracing::warn!(workunit = %key, "results for a work unit not in flight");
                    continue;
                };
                if args.success {
                    unit.job.completed = Some(now);
                    unit.job.status = JobStatus::Complete;
                    finished.push((unit.job.subtask_key.clone(), unit.job.started.unwrap_or(now)));
                } else {
                    unit.job.worker = None;
                    unit.job.started = None;
                    unit.job.status = JobStatus::Queued;
                    unit.batch = None;
                    failed.push(unit);
                }
            }
            // Front-pushed in reverse so the units keep their queue order.
            for unit in failed.into_iter().rev() {
                entry.instance.requests.requeue_front(QueueEntry::Request(unit));
            }
            if args.success {
                entry.instance.last_success = Some(now);
            }
            entry.instance.running_workers.retain(|w| w != caller);
            (entry.instance.main_worker().map(str::to_string), finished)
        };

        // The assisting worker is free again either way.
        self.assignments.lock().expect("lock poisoned").remove(caller);

        if !args.success {
            tracing::warn!(
                worker = caller,
                task = %args.task_key,
                "sub-work failed, units requeued"
            );
            return Ok(Value::Null);
        }

        for (subtask_key, started) in finished {
            self.archive_completed(&args.task_key, subtask_key, caller, &args.version, started, now);
        }

        // Route the results into the root task still running on the main
        // worker.
        if let Some(main) = main_worker {
            let peer = self.workers.lock().expect("lock poisoned").peer(&main);
            let Some(peer) = peer else {
                tracing::error!(
                    worker = %main,
                    task = %args.task_key,
                    "main worker gone, sub-results dropped"
                );
                return Ok(Value::Null);
            };
            let routed = ReceiveResultsArgs {
                results: args.results,
                subtask_key: args.subtask_key.unwrap_or_default(),
                workunit_key,
            };
            if let Err(e) = peer.call("receive_results", serde_json::to_value(&routed)?).await {
                tracing::error!(
                    worker = %main,
                    task = %args.task_key,
                    error = %e,
                    "failed to route sub-results to main worker"
                );
            }
        }
        Ok(Value::Null)
    }

    fn complete_root(
        &self,
        caller: &str,
        instance_id: Uuid,
        args: SendResultsArgs,
        now: DateTime<Utc>,
    ) -> Result<Value> {
        let started = {
            let mut tasks = self.tasks.lock().expect("lock poisoned");
            let entry = tasks
                .get_mut(&instance_id)
                .ok_or_else(|| MeshError::TaskNotFound(instance_id.to_string()))?;
            entry.instance.job.completed = Some(now);
            entry.instance.job.status = if args.success {
                JobStatus::Complete
            } else {
                JobStatus::Failed
            };
            entry.instance.results = Some(args.results.clone());
            entry.instance.job.started.unwrap_or(now)
        };

        self.assignments.lock().expect("lock poisoned").remove(caller);

        if args.success {
            self.archive_completed(&args.task_key, None, caller, &args.version, started, now);
        }
        tracing::info!(
            task = %args.task_key,
            task_id = %instance_id,
            worker = caller,
            success = args.success,
            "task finished"
        );
        Ok(Value::Null)
    }

    fn archive_completed(
        &self,
        task_key: &str,
        subtask_key: Option<String>,
        worker: &str,
        version: &str,
        started: DateTime<Utc>,
        completed: DateTime<Utc>,
    ) {
        self.archive
            .push(task_key, subtask_key, worker, version, started, completed);
    }

    /// Alive workers with nothing assigned.
    fn idle_workers(&self) -> Vec<String> {
        let alive = self.workers.lock().expect("lock poisoned").alive_keys();
        let assignments = self.assignments.lock().expect("lock poisoned");
        let mut idle: Vec<String> = alive
            .into_iter()
            .filter(|key| !assignments.contains_key(key))
            .collect();
        idle.sort();
        idle
    }

    fn on_worker_disconnect(&self, key: &str) {
        self.workers.lock().expect("lock poisoned").remove(key);
        let assignment = self.assignments.lock().expect("lock poisoned").remove(key);
        let Some(assignment) = assignment else { return };

        let mut tasks = self.tasks.lock().expect("lock poisoned");
        let Some(entry) = tasks.get_mut(&assignment.instance) else {
            return;
        };

        if assignment.main {
            // Root lost its worker. Requeue the instance from scratch;
            // in-flight sub-results have nowhere to route anymore.
            tracing::warn!(
                worker = key,
                task = %entry.instance.job.task_key,
                "main worker lost, requeueing task"
            );
            entry.instance.job.worker = None;
            entry.instance.job.started = None;
            entry.instance.job.status = JobStatus::Queued;
            entry.instance.running_workers.clear();
            entry.in_flight.clear();
            while entry.instance.requests.dequeue().is_some() {}
        } else {
            entry.instance.running_workers.retain(|w| w != key);
            let lost: Vec<String> = entry
                .in_flight
                .iter()
                .filter(|(_, unit)| unit.job.worker.as_deref() == Some(key))
                .map(|(k, _)| k.clone())
                .collect();
            tracing::warn!(
                worker = key,
                task = %entry.instance.job.task_key,
                units = lost.len(),
                "worker lost, requeueing its sub-units"
            );
            for workunit in lost {
                if let Some(mut unit) = entry.in_flight.remove(&workunit) {
                    unit.job.worker = None;
                    unit.job.started = None;
                    unit.job.status = JobStatus::Queued;
                    unit.batch = None;
                    entry.instance.requests.requeue_front(QueueEntry::Request(unit));
                }
            }
        }
    }

    /// Decide what to send where. State is updated optimistically under
    /// the locks; failed dispatches are rolled back afterwards.
    fn plan_dispatch(&self, idle: &mut Vec<String>) -> Vec<DispatchPlan> {
        let now = Utc::now();
        let mut plans = Vec::new();
        let mut tasks = self.tasks.lock().expect("lock poisoned");
        let mut assignments = self.assignments.lock().expect("lock poisoned");

        // Start queued root tasks first, oldest first.
        let mut queued: Vec<(Option<DateTime<Utc>>, Uuid)> = tasks
            .iter()
            .filter(|(_, e)| e.instance.job.status == JobStatus::Queued)
            .map(|(id, e)| (e.instance.job.queued, *id))
            .collect();
        queued.sort();

        for (_, id) in queued {
            if idle.is_empty() {
                return plans;
            }
            let Some(entry) = tasks.get_mut(&id) else { continue };
            let worker = idle.remove(0);
            entry.instance.job.worker = Some(worker.clone());
            entry.instance.job.started = Some(now);
            entry.instance.job.status = JobStatus::Running;
            assignments.insert(worker.clone(), Assignment { instance: id, main: true });
            plans.push(DispatchPlan {
                worker,
                instance: id,
                main: true,
                args: RunTaskArgs {
                    key: entry.instance.job.task_key.clone(),
                    args: entry.instance.job.args.clone(),
                    subtask_key: None,
                    workunit_key: None,
                    available_workers: idle.len() as u32 + 1,
                },
                units: Vec::new(),
            });
        }

        // Then farm out pending sub-work, batching as we go.
        let mut running: Vec<(Option<DateTime<Utc>>, Uuid)> = tasks
            .iter()
            .filter(|(_, e)| {
                e.instance.job.status == JobStatus::Running && !e.instance.requests.is_empty()
            })
            .map(|(id, e)| (e.instance.job.queued, *id))
            .collect();
        running.sort();

        'instances: for (_, id) in running {
            loop {
                if idle.is_empty() {
                    break 'instances;
                }
                let Some(entry) = tasks.get_mut(&id) else { continue 'instances };
                let Some(dispatch) = entry.instance.build_batch(self.config.batch_target) else {
                    continue 'instances;
                };
                let worker = idle.remove(0);

                let (args, units) = match dispatch {
                    Dispatch::Local => {
                        // Instances never queue local entries on the
                        // master side; put the worker back and move on.
                        idle.insert(0, worker);
                        continue 'instances;
                    }
                    Dispatch::Single(mut unit) => {
                        unit.job.worker = Some(worker.clone());
                        unit.job.started = Some(now);
                        unit.job.status = JobStatus::Running;
                        let args = RunTaskArgs {
                            key: entry.instance.job.task_key.clone(),
                            args: unit.job.args.clone(),
                            subtask_key: unit.job.subtask_key.clone(),
                            workunit_key: Some(Value::String(unit.workunit.clone())),
                            available_workers: 1,
                        };
                        entry.in_flight.insert(unit.workunit.clone(), unit.clone());
                        (args, vec![unit])
                    }
                    Dispatch::Grouped(mut batch) => {
                        batch.assign_worker(&worker);
                        batch.mark_started(now);
                        let args = RunTaskArgs {
                            key: entry.instance.job.task_key.clone(),
                            args: entry.instance.job.args.clone(),
                            subtask_key: Some(batch.subtask_key.clone()),
                            workunit_key: Some(batch.transmitable()),
                            available_workers: 1,
                        };
                        let units = batch.into_units();
                        for unit in &units {
                            entry.in_flight.insert(unit.workunit.clone(), unit.clone());
                        }
                        (args, units)
                    }
                };

                entry.instance.last_success = Some(now);
                entry.instance.running_workers.push(worker.clone());
                assignments.insert(worker.clone(), Assignment { instance: id, main: false });
                plans.push(DispatchPlan {
                    worker,
                    instance: id,
                    main: false,
                    args,
                    units,
                });
            }
        }

        plans
    }

    /// Undo the table updates for a dispatch that never reached its worker.
    fn rollback(&self, plan: &DispatchPlan) {
        self.assignments
            .lock()
            .expect("lock poisoned")
            .remove(&plan.worker);

        let mut tasks = self.tasks.lock().expect("lock poisoned");
        let Some(entry) = tasks.get_mut(&plan.instance) else {
            return;
        };
        if plan.main {
            entry.instance.job.worker = None;
            entry.instance.job.started = None;
            entry.instance.job.status = JobStatus::Queued;
        } else {
            entry.instance.running_workers.retain(|w| w != &plan.worker);
            // Reverse order keeps the original FIFO order at the front.
            for planned in plan.units.iter().rev() {
                if let Some(mut unit) = entry.in_flight.remove(&planned.workunit) {
                    unit.job.worker = None;
                    unit.job.started = None;
                    unit.job.status = JobStatus::Queued;
                    unit.batch = None;
                    entry.instance.requests.requeue_front(QueueEntry::Request(unit));
                }
            }
        }
    }
}

struct DispatchPlan {
    worker: String,
    instance: Uuid,
    main: bool,
    args: RunTaskArgs,
    units: Vec<WorkUnit>,
}

/// The methods the master exposes to workers and clients.
fn remote_registry(shared: &Arc<MasterShared>) -> RemoteRegistry {
    let mut registry = RemoteRegistry::new();

    let s = shared.clone();
    registry.register("heartbeat", move |caller, _args| {
        let s = s.clone();
        async move {
            s.heartbeat(&caller);
            Ok(Value::Null)
        }
    });

    let s = shared.clone();
    registry.register("send_results", move |caller, args| {
        let s = s.clone();
        async move {
            let args: SendResultsArgs = serde_json::from_value(args)?;
            s.send_results(&caller, args).await
        }
    });

    let s = shared.clone();
    registry.register("request_worker", move |caller, args| {
        let s = s.clone();
        async move {
            let args: RequestWorkerArgs = serde_json::from_value(args)?;
            s.request_worker(&caller, args)?;
            Ok(Value::Null)
        }
    });

    let s = shared.clone();
    registry.register("submit_task", move |_caller, args| {
        let s = s.clone();
        async move {
            let args: SubmitTaskArgs = serde_json::from_value(args)?;
            Ok(s.submit_task(args))
        }
    });

    let s = shared.clone();
    registry.register("task_status", move |_caller, args| {
        let s = s.clone();
        async move {
            let args: TaskStatusArgs = serde_json::from_value(args)?;
            s.task_status(args)
        }
    });

    let s = shared.clone();
    registry.register("list_tasks", move |_caller, _args| {
        let s = s.clone();
        async move { Ok(s.list_tasks()) }
    });

    let s = shared.clone();
    registry.register("task_statistics", move |_caller, args| {
        let s = s.clone();
        async move {
            let query: StatsQuery = serde_json::from_value(args)?;
            Ok(s.stats.read().expect("lock poisoned").query(&query))
        }
    });

    registry
}

async fn handle_session(
    shared: Arc<MasterShared>,
    registry: Arc<RemoteRegistry>,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<()> {
    let mut framed = wire::frame(stream);

    let Some(Envelope::Login { key, secret, role }) = wire::recv(&mut framed).await? else {
        tracing::warn!(%addr, "session did not start with a login frame");
        return Ok(());
    };

    let accepted = secret == shared.config.secret;
    wire::send(&mut framed, &Envelope::LoginAck { accepted }).await?;
    if !accepted {
        tracing::warn!(%addr, key, "login rejected, bad secret");
        return Ok(());
    }

    let gateway = Arc::new(SessionGateway::authenticated(registry, key.clone()));
    let peer = Peer::spawn(
        framed,
        gateway,
        Duration::from_millis(shared.config.call_timeout_ms),
    );

    match role {
        SessionRole::Worker => {
            shared
                .workers
                .lock()
                .expect("lock poisoned")
                .register(&key, peer.clone());
            peer.wait_closed().await;
            shared.on_worker_disconnect(&key);
        }
        SessionRole::Client => {
            tracing::debug!(%addr, key, "client session open");
            peer.wait_closed().await;
        }
    }
    Ok(())
}

async fn distribution_loop(shared: Arc<MasterShared>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_millis(
        shared.config.assign_interval_ms,
    ));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        distribute_once(&shared).await;
    }
    tracing::debug!("distribution loop stopped");
}

async fn distribute_once(shared: &Arc<MasterShared>) {
    let mut idle = shared.idle_workers();
    if idle.is_empty() {
        return;
    }
    let plans = shared.plan_dispatch(&mut idle);

    for plan in plans {
        let peer = shared.workers.lock().expect("lock poisoned").peer(&plan.worker);
        let sent = match peer {
            Some(peer) => match serde_json::to_value(&plan.args) {
                Ok(args) => peer.call("run_task", args).await,
                Err(e) => Err(MeshError::Codec(e)),
            },
            None => Err(MeshError::NotConnected),
        };
        match sent {
            Ok(_) => {
                tracing::info!(
                    worker = %plan.worker,
                    task = %plan.args.key,
                    subtask = plan.args.subtask_key.as_deref(),
                    units = plan.units.len(),
                    "work dispatched"
                );
            }
            Err(e) => {
                tracing::warn!(
                    worker = %plan.worker,
                    task = %plan.args.key,
                    error = %e,
                    "dispatch failed, rolling back"
                );
                shared.rollback(&plan);
            }
        }
    }
}

/// An unstarted master. [`Master::bind`] claims the listen address.
pub struct Master {
    shared: Arc<MasterShared>,
    stats_rx: mpsc::UnboundedReceiver<CompletedJob>,
}

impl Master {
    pub fn new(config: MasterConfig) -> Self {
        let (stats_tx, stats_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(MasterShared {
            workers: Mutex::new(WorkerPool::new(config.worker_timeout_ms)),
            tasks: Mutex::new(HashMap::new()),
            assignments: Mutex::new(HashMap::new()),
            stats: Arc::new(RwLock::new(StatsRegistry::new())),
            archive: Arc::new(ArchiveStore::new(stats_tx)),
            config,
        });
        Self { shared, stats_rx }
    }

    /// Bind the listener. Separate from [`BoundMaster::serve`] so callers
    /// can learn the actual port when binding port zero.
    pub async fn bind(self) -> Result<BoundMaster> {
        let listener = TcpListener::bind(self.shared.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "master listening");
        Ok(BoundMaster {
            listener,
            local_addr,
            shared: self.shared,
            stats_rx: self.stats_rx,
        })
    }
}

pub struct BoundMaster {
    listener: TcpListener,
    local_addr: SocketAddr,
    shared: Arc<MasterShared>,
    stats_rx: mpsc::UnboundedReceiver<CompletedJob>,
}

impl BoundMaster {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the accept loop, the distribution loop and the statistics
    /// engine until `shutdown` fires.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        let registry = Arc::new(remote_registry(&self.shared));
        tracing::debug!(methods = ?registry.method_names(), "remote surface ready");

        tokio::spawn(run_engine(
            self.shared.stats.clone(),
            self.stats_rx,
            self.shared.archive.clone() as Arc<dyn CompletedJobSource>,
            Duration::from_millis(self.shared.config.stats_interval_ms),
            shutdown.child_token(),
        ));
        tokio::spawn(distribution_loop(self.shared.clone(), shutdown.child_token()));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => {
                    let (stream, addr) = accepted?;
                    let shared = self.shared.clone();
                    let registry = registry.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_session(shared, registry, stream, addr).await {
                            tracing::warn!(%addr, error = %e, "session ended with error");
                        }
                    });
                }
            }
        }
        tracing::info!("master stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn archive_assigns_increasing_seq() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let archive = ArchiveStore::new(tx);
        let now = Utc::now();
        let a = archive.push("t", None, "w1", "1.0", now, now);
        let b = archive.push("t", Some("s".into()), "w2", "1.0", now, now);
        assert_eq!(a.seq, 1);
        assert_eq!(b.seq, 2);

        let all = archive.completed_since(0).await;
        assert_eq!(all.len(), 2);
        let tail = archive.completed_since(1).await;
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].seq, 2);
        assert!(archive.completed_since(2).await.is_empty());
    }

    // Concurrent completions must reach the statistics channel in seq
    // order, or the engine's cursor would drop the late arrival.
    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_pushes_reach_stats_channel_in_seq_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let archive = Arc::new(ArchiveStore::new(tx));
        let now = Utc::now();

        let mut handles = Vec::new();
        for i in 0..64 {
            let archive = archive.clone();
            handles.push(tokio::spawn(async move {
                archive.push("t", None, &format!("w{i}"), "1.0", now, now);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        drop(archive);

        let mut last = 0;
        for _ in 0..64 {
            let record = rx.recv().await.unwrap();
            assert_eq!(record.seq, last + 1);
            last = record.seq;
        }
    }
}
