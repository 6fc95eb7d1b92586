//! Worker process: connects to the master, runs one task at a time.
//!
//! # Components
//!
//! - [`WorkerRuntime`]: connection state machine, busy gate, result
//!   retention and the remote methods the master can call
//! - [`tasks`]: the [`RunnableTask`](tasks::RunnableTask) trait, the task
//!   registry and the built-in demo tasks
//! - [`heartbeat`]: periodic keep-alive pings while connected
//!
//! # Lifecycle
//!
//! 1. [`WorkerRuntime::run`] connects and logs in, retrying with
//!    exponential backoff on failure
//! 2. The master calls `run_task`; the runtime instantiates the task and
//!    runs it on its own tokio task
//! 3. Completion is reported through `send_results`; undeliverable results
//!    are held and re-sent on the next connect

pub mod heartbeat;
pub mod runtime;
pub mod tasks;

pub use runtime::{reconnect_delay, Backoff, WorkerRuntime, WorkerStatus};
pub use tasks::{RunnableTask, TaskContext, TaskRegistry};
