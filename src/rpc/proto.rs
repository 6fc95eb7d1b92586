//! Argument shapes for the remote methods exchanged between master and
//! worker. Both sides serialize through these structs so the contract stays
//! in one place.

use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_size() -> u32 {
    1
}

fn default_available() -> u32 {
    1
}

/// Arguments for `run_task`: master asks a worker to start a task or sub-unit.
///
/// For a sub-unit dispatch `workunit_key` is either a single key string or
/// a batch transmitable map of `{subtask_key: [workunit keys]}`; the worker
/// treats it opaquely and echoes it back in `send_results`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTaskArgs {
    pub key: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub subtask_key: Option<String>,
    #[serde(default)]
    pub workunit_key: Option<Value>,
    #[serde(default = "default_available")]
    pub available_workers: u32,
}

/// Arguments for `receive_results`: master routes sub-results into the main worker's
/// running task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiveResultsArgs {
    pub results: Value,
    pub subtask_key: String,
    pub workunit_key: Value,
}

/// Arguments for `send_results`: worker reports a finished task or sub-unit back to the
/// master. `workunit_key` is absent for a root task completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendResultsArgs {
    pub task_key: String,
    #[serde(default)]
    pub subtask_key: Option<String>,
    #[serde(default)]
    pub workunit_key: Option<Value>,
    pub results: Value,
    pub success: bool,
    /// Version of the task implementation that produced the results.
    #[serde(default)]
    pub version: String,
}

/// Arguments for `request_worker`: one-way notification that a running task wants more
/// remote capacity for a sub-unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestWorkerArgs {
    pub subtask_key: String,
    #[serde(default)]
    pub args: Value,
    pub workunit_key: String,
    #[serde(default = "default_size")]
    pub size: u32,
}

/// Arguments for `submit_task`: client queues a new task on the master.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitTaskArgs {
    pub task_key: String,
    #[serde(default)]
    pub args: Value,
}

/// Arguments for `task_status`: client asks for the state of one task instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusArgs {
    pub task_id: uuid::Uuid,
}
