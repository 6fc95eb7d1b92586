//! Runnable task definitions and the registry a worker serves them from.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

use crate::error::{MeshError, Result};
use crate::work::flatten_transmitable;

/// A request for help with part of a divisible task, forwarded by the
/// runtime to the master as a `request_worker` notification.
#[derive(Debug, Clone)]
pub struct WorkRequest {
    pub subtask_key: String,
    pub args: Value,
    pub workunit_key: String,
    pub size: u32,
}

/// Results for one work unit, delivered back to the root run of a task.
#[derive(Debug, Clone)]
pub struct SubResult {
    pub subtask_key: String,
    pub workunit_key: Value,
    pub results: Value,
}

/// Everything a running task can see and do.
///
/// A root run has no `subtask_key` and may receive sub-results; a work-unit
/// run carries the subtask and work-unit keys it was dispatched with.
pub struct TaskContext {
    pub args: Value,
    pub subtask_key: Option<String>,
    pub workunit_key: Option<Value>,
    requests: mpsc::UnboundedSender<WorkRequest>,
    subresults: Option<mpsc::UnboundedReceiver<SubResult>>,
}

impl TaskContext {
    pub fn new(
        args: Value,
        subtask_key: Option<String>,
        workunit_key: Option<Value>,
        requests: mpsc::UnboundedSender<WorkRequest>,
        subresults: Option<mpsc::UnboundedReceiver<SubResult>>,
    ) -> Self {
        Self {
            args,
            subtask_key,
            workunit_key,
            requests,
            subresults,
        }
    }

    pub fn is_workunit(&self) -> bool {
        self.subtask_key.is_some()
    }

    /// Ask the master for another worker to run `subtask_key` on the unit
    /// named by `workunit_key`. Best effort, the request queues on the
    /// master and may come back to this worker's own pool.
    pub fn request_worker(
        &self,
        subtask_key: &str,
        args: Value,
        workunit_key: &str,
        size: u32,
    ) -> Result<()> {
        self.requests
            .send(WorkRequest {
                subtask_key: subtask_key.to_string(),
                args,
                workunit_key: workunit_key.to_string(),
                size,
            })
            .map_err(|_| MeshError::NotConnected)
    }

    /// Wait for the next batch of sub-results. `None` once the runtime has
    /// torn the channel down.
    pub async fn next_subresult(&mut self) -> Option<SubResult> {
        match &mut self.subresults {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }
}

/// A task a worker knows how to run.
#[async_trait]
pub trait RunnableTask: Send + Sync {
    async fn run(&self, ctx: TaskContext) -> Result<Value>;
}

type TaskFactory = Arc<dyn Fn() -> Arc<dyn RunnableTask> + Send + Sync>;

struct TaskEntry {
    factory: TaskFactory,
    version: String,
}

/// Name to task mapping served by a worker. Instantiation happens before
/// the busy gate so an unknown key never wedges the worker.
pub struct TaskRegistry {
    tasks: HashMap<String, TaskEntry>,
}

impl TaskRegistry {
    /// Registry preloaded with the built-in tasks.
    pub fn new() -> Self {
        let mut registry = Self {
            tasks: HashMap::new(),
        };
        registry.register("demo.echo", "1.0", || Arc::new(EchoTask));
        registry.register("demo.fanout", "1.0", || Arc::new(FanoutTask));
        registry
    }

    pub fn register<F>(&mut self, key: &str, version: &str, factory: F)
    where
        F: Fn() -> Arc<dyn RunnableTask> + Send + Sync + 'static,
    {
        self.tasks.insert(
            key.to_string(),
            TaskEntry {
                factory: Arc::new(factory),
                version: version.to_string(),
            },
        );
    }

    /// Instantiate a task along with its registered version.
    pub fn instantiate(&self, key: &str) -> Result<(Arc<dyn RunnableTask>, String)> {
        let entry = self
            .tasks
            .get(key)
            .ok_or_else(|| MeshError::TaskNotFound(key.to_string()))?;
        Ok(((entry.factory)(), entry.version.clone()))
    }

    pub fn task_list(&self) -> Value {
        Value::Object(
            self.tasks
                .iter()
                .map(|(key, entry)| (key.clone(), json!({ "version": entry.version })))
                .collect(),
        )
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns its arguments unchanged. Smallest possible end-to-end check.
pub struct EchoTask;

#[async_trait]
impl RunnableTask for EchoTask {
    async fn run(&self, ctx: TaskContext) -> Result<Value> {
        Ok(ctx.args)
    }
}

/// Divisible demo task. The root run requests one worker per entry in
/// `args["items"]` and merges the doubled values; a work-unit run doubles
/// the entries its work-unit keys index.
pub struct FanoutTask;

impl FanoutTask {
    pub const SUBTASK: &'static str = "double";

    fn item(args: &Value, key: &str) -> Result<f64> {
        let index: usize = key
            .parse()
            .map_err(|_| MeshError::MalformedRecord(format!("bad workunit key {key:?}")))?;
        args.get("items")
            .and_then(|items| items.get(index))
            .and_then(Value::as_f64)
            .ok_or_else(|| MeshError::MalformedRecord(format!("no item at index {index}")))
    }
}

#[async_trait]
impl RunnableTask for FanoutTask {
    async fn run(&self, mut ctx: TaskContext) -> Result<Value> {
        if ctx.is_workunit() {
            // Work-unit run: key is either a plain string or a batch
            // mapping of subtask to key list.
            let workunit_key = ctx.workunit_key.clone().unwrap_or(Value::Null);
            let keys = match &workunit_key {
                Value::String(key) => vec![key.clone()],
                other => flatten_transmitable(other),
            };
            let mut out = Map::new();
            for key in keys {
                let value = Self::item(&ctx.args, &key)?;
                out.insert(key, json!(value * 2.0));
            }
            return Ok(Value::Object(out));
        }

        let total = ctx
            .args
            .get("items")
            .and_then(Value::as_array)
            .map(Vec::len)
            .ok_or_else(|| MeshError::MalformedRecord("fanout needs an items list".into()))?;

        for index in 0..total {
            ctx.request_worker(Self::SUBTASK, ctx.args.clone(), &index.to_string(), 1)?;
        }

        let mut merged = Map::new();
        while merged.len() < total {
            let Some(sub) = ctx.next_subresult().await else {
                return Err(MeshError::NotConnected);
            };
            if let Value::Object(results) = sub.results {
                merged.extend(results);
            }
        }
        Ok(Value::Object(merged))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(args: Value, subtask: Option<&str>, key: Option<Value>) -> TaskContext {
        let (tx, _rx) = mpsc::unbounded_channel();
        TaskContext::new(args, subtask.map(String::from), key, tx, None)
    }

    #[tokio::test]
    async fn echo_returns_args() {
        let task = EchoTask;
        let result = task
            .run(context(json!({"hello": "world"}), None, None))
            .await
            .unwrap();
        assert_eq!(result, json!({"hello": "world"}));
    }

    #[tokio::test]
    async fn fanout_workunit_doubles_single_key() {
        let task = FanoutTask;
        let args = json!({"items": [1.0, 2.0, 3.0]});
        let result = task
            .run(context(args, Some("double"), Some(json!("1"))))
            .await
            .unwrap();
        assert_eq!(result, json!({"1": 4.0}));
    }

    #[tokio::test]
    async fn fanout_workunit_doubles_batched_keys() {
        let task = FanoutTask;
        let args = json!({"items": [1.0, 2.0, 3.0]});
        let result = task
            .run(context(
                args,
                Some("double"),
                Some(json!({"double": ["0", "2"]})),
            ))
            .await
            .unwrap();
        assert_eq!(result, json!({"0": 2.0, "2": 6.0}));
    }

    #[test]
    fn registry_knows_builtins() {
        let registry = TaskRegistry::new();
        assert!(registry.instantiate("demo.echo").is_ok());
        let (_, version) = registry.instantiate("demo.fanout").unwrap();
        assert_eq!(version, "1.0");
        assert!(matches!(
            registry.instantiate("no.such.task"),
            Err(MeshError::TaskNotFound(_))
        ));
    }
}
