use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::work::queue::RequestQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Running,
    Paused,
    Stopped,
    Cancelled,
    Failed,
    Complete,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Paused => write!(f, "paused"),
            JobStatus::Stopped => write!(f, "stopped"),
            JobStatus::Cancelled => write!(f, "cancelled"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Complete => write!(f, "complete"),
        }
    }
}

/// Fields shared by every job-like record.
///
/// task_key:    identifies the code to run
/// subtask_key: path within the task identifying the child to run
/// args:        serialized arguments passed to the task
/// worker:      key of the worker the job is assigned to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFields {
    pub task_key: String,
    pub subtask_key: Option<String>,
    pub args: Value,
    pub queued: Option<DateTime<Utc>>,
    pub started: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
    pub worker: Option<String>,
    pub status: JobStatus,
}

impl JobFields {
    pub fn new(task_key: impl Into<String>, args: Value) -> Self {
        Self {
            task_key: task_key.into(),
            subtask_key: None,
            args,
            queued: Some(Utc::now()),
            started: None,
            completed: None,
            worker: None,
            status: JobStatus::Queued,
        }
    }
}

/// One root task execution.
///
/// Created when a task is queued, mutated by the master as sub-work is
/// requested and completed, archived once complete and its results have
/// been retrieved.
#[derive(Debug)]
pub struct TaskInstance {
    pub id: Uuid,
    pub job: JobFields,
    pub priority: i32,
    /// Workers currently running sub-work, excluding the main worker.
    pub running_workers: Vec<String>,
    /// When this task last received a worker.
    pub last_success: Option<DateTime<Utc>>,
    /// Pending remote-work requests; only ever popped by the batch builder.
    pub requests: RequestQueue,
    pub results: Option<Value>,
}

impl TaskInstance {
    pub fn new(task_key: impl Into<String>, args: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            job: JobFields::new(task_key, args),
            priority: 5,
            running_workers: Vec::new(),
            last_success: None,
            requests: RequestQueue::new(),
            results: None,
        }
    }

    /// The worker the root task itself runs on.
    pub fn main_worker(&self) -> Option<&str> {
        self.job.worker.as_deref()
    }

    pub fn summary(&self) -> Value {
        json!({
            "id": self.id,
            "task_key": self.job.task_key,
            "status": self.job.status.to_string(),
            "worker": self.job.worker,
            "queued": self.job.queued,
            "started": self.job.started,
            "completed": self.job.completed,
            "results": self.results,
        })
    }
}

/// One indivisible sub-unit of a task.
///
/// `workunit` uniquely identifies this unit within the task's datasource;
/// `size` weighs it for batching.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub id: Uuid,
    pub task_instance: Uuid,
    pub job: JobFields,
    pub workunit: String,
    pub size: u32,
    pub batch: Option<Uuid>,
}

impl WorkUnit {
    pub fn new(
        task_instance: Uuid,
        task_key: &str,
        subtask_key: &str,
        args: Value,
        workunit: impl Into<String>,
        size: u32,
    ) -> Self {
        let mut job = JobFields::new(task_key, args);
        job.subtask_key = Some(subtask_key.to_string());
        Self {
            id: Uuid::new_v4(),
            task_instance,
            job,
            workunit: workunit.into(),
            size,
            batch: None,
        }
    }

    /// Whether this unit is assigned to the instance's main worker.
    pub fn on_main_worker(&self, instance_worker: Option<&str>) -> bool {
        instance_worker.is_some() && self.job.worker.as_deref() == instance_worker
    }

    pub fn transmitable(&self) -> Value {
        let subtask = self.job.subtask_key.clone().unwrap_or_default();
        json!({ subtask: [self.workunit] })
    }
}

/// A group of work units sharing one subtask key, transmitted as a single
/// remote call to amortize dispatch overhead.
///
/// Assignment writes fan out explicitly onto every contained unit; the
/// batch's size is the sum of its members' sizes.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: Uuid,
    pub task_instance: Uuid,
    pub task_key: String,
    pub subtask_key: String,
    pub args: Value,
    pub size: u32,
    pub worker: Option<String>,
    pub started: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
    pub status: JobStatus,
    units: Vec<WorkUnit>,
}

impl Batch {
    /// Build a batch from units that share a subtask key. The batch id is
    /// recorded back on each member.
    pub fn from_units(
        task_instance: Uuid,
        task_key: &str,
        args: Value,
        mut units: Vec<WorkUnit>,
    ) -> Self {
        let id = Uuid::new_v4();
        let subtask_key = units
            .first()
            .and_then(|u| u.job.subtask_key.clone())
            .unwrap_or_default();
        debug_assert!(units
            .iter()
            .all(|u| u.job.subtask_key.as_deref() == Some(subtask_key.as_str())));
        let size = units.iter().map(|u| u.size).sum();
        for unit in &mut units {
            unit.batch = Some(id);
        }
        Self {
            id,
            task_instance,
            task_key: task_key.to_string(),
            subtask_key,
            args,
            size,
            worker: None,
            started: None,
            completed: None,
            status: JobStatus::Queued,
            units,
        }
    }

    pub fn units(&self) -> &[WorkUnit] {
        &self.units
    }

    pub fn into_units(self) -> Vec<WorkUnit> {
        self.units
    }

    pub fn assign_worker(&mut self, worker: &str) {
        self.worker = Some(worker.to_string());
        for unit in &mut self.units {
            unit.job.worker = Some(worker.to_string());
        }
    }

    pub fn mark_started(&mut self, at: DateTime<Utc>) {
        self.started = Some(at);
        self.status = JobStatus::Running;
        for unit in &mut self.units {
            unit.job.started = Some(at);
            unit.job.status = JobStatus::Running;
        }
    }

    pub fn mark_completed(&mut self, at: DateTime<Utc>) {
        self.completed = Some(at);
        self.status = JobStatus::Complete;
        for unit in &mut self.units {
            unit.job.completed = Some(at);
            unit.job.status = JobStatus::Complete;
        }
    }

    pub fn on_main_worker(&self, instance_worker: Option<&str>) -> bool {
        instance_worker.is_some() && self.worker.as_deref() == instance_worker
    }

    /// The map sent over the wire: subtask key to the member workunit keys.
    pub fn transmitable(&self) -> Value {
        let keys: Vec<&str> = self.units.iter().map(|u| u.workunit.as_str()).collect();
        json!({ self.subtask_key.clone(): keys })
    }
}

/// The job-like values callers pass around, as an explicit sum type.
#[derive(Debug)]
pub enum WorkItem {
    Root(TaskInstance),
    Single(WorkUnit),
    Grouped(Batch),
}

impl WorkItem {
    /// Identity of the owning task instance.
    pub fn task_id(&self) -> Uuid {
        match self {
            WorkItem::Root(instance) => instance.id,
            WorkItem::Single(unit) => unit.task_instance,
            WorkItem::Grouped(batch) => batch.task_instance,
        }
    }

    /// The workunit-key payload sent to a remote worker. A root task has
    /// nothing to transmit; it runs where it was started.
    pub fn transmitable(&self) -> Option<Value> {
        match self {
            WorkItem::Root(_) => None,
            WorkItem::Single(unit) => Some(unit.transmitable()),
            WorkItem::Grouped(batch) => Some(batch.transmitable()),
        }
    }

    pub fn on_main_worker(&self, instance_worker: Option<&str>) -> bool {
        match self {
            WorkItem::Root(_) => true,
            WorkItem::Single(unit) => unit.on_main_worker(instance_worker),
            WorkItem::Grouped(batch) => batch.on_main_worker(instance_worker),
        }
    }
}

/// Flatten a workunit-key payload back into individual keys: either a bare
/// key string or a batch transmitable map of key lists.
pub fn flatten_transmitable(value: &Value) -> Vec<String> {
    match value {
        Value::String(key) => vec![key.clone()],
        Value::Object(map) => map
            .values()
            .flat_map(|keys| keys.as_array().into_iter().flatten())
            .filter_map(|key| key.as_str().map(String::from))
            .collect(),
        _ => Vec::new(),
    }
}
