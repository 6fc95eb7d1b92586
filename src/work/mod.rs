pub mod job;
pub mod queue;

pub use job::{flatten_transmitable, Batch, JobFields, JobStatus, TaskInstance, WorkItem, WorkUnit};
pub use queue::{Dispatch, QueueEntry, RequestQueue};
