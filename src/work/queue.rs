//! Per-instance FIFO of pending worker requests and the batch builder that
//! drains it.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::work::job::{Batch, TaskInstance, WorkUnit};

/// An entry in a task instance's request queue: either the instance's own
/// local work or a request to farm a unit out to another worker.
#[derive(Debug, Clone)]
pub enum QueueEntry {
    Local,
    Request(WorkUnit),
}

/// What the batch builder hands the dispatcher.
#[derive(Debug)]
pub enum Dispatch {
    /// The instance's own work; nothing to transmit.
    Local,
    /// A single unit, sent without batching overhead.
    Single(WorkUnit),
    /// A size-bounded batch of units sharing one subtask key.
    Grouped(Batch),
}

/// Thread-safe FIFO of pending worker requests.
///
/// Pushes arrive concurrently from many sub-task completions; only the
/// batch builder for the owning instance ever pops. All three operations
/// share one mutex so no request is lost or duplicated.
#[derive(Debug, Default)]
pub struct RequestQueue {
    entries: Mutex<VecDeque<QueueEntry>>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, entry: QueueEntry) {
        self.entries.lock().expect("lock poisoned").push_back(entry);
    }

    /// Put an entry back at the front, preserving FIFO order after a failed
    /// dispatch.
    pub fn requeue_front(&self, entry: QueueEntry) {
        self.entries
            .lock()
            .expect("lock poisoned")
            .push_front(entry);
    }

    /// The oldest pending entry without removing it.
    pub fn peek(&self) -> Option<QueueEntry> {
        self.entries
            .lock()
            .expect("lock poisoned")
            .front()
            .cloned()
    }

    pub fn dequeue(&self) -> Option<QueueEntry> {
        self.entries.lock().expect("lock poisoned").pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TaskInstance {
    /// Coalesce queued requests into a dispatchable unit of roughly
    /// `target` size.
    ///
    /// The sole remaining local entry, or a lone pending request, is
    /// returned directly; batching overhead is not worth it for singletons.
    /// Otherwise requests are accepted until the batch would exceed the
    /// target by more than 25%; the cap is never enforced against the first
    /// item, so oversized sub-work is dispatched rather than starved.
    /// An empty queue yields `None`, the normal nothing-to-send outcome.
    pub fn build_batch(&self, target: u32) -> Option<Dispatch> {
        let front = self.requests.peek()?;
        if matches!(front, QueueEntry::Local) || self.requests.len() == 1 {
            return self.requests.dequeue().map(|entry| match entry {
                QueueEntry::Local => Dispatch::Local,
                QueueEntry::Request(unit) => Dispatch::Single(unit),
            });
        }

        let cap = target + target / 4;
        let mut units: Vec<WorkUnit> = Vec::new();
        let mut total = 0u32;

        while total < target {
            // Local work mid-queue stays put for its own dispatch.
            let next = match self.requests.peek() {
                Some(QueueEntry::Request(unit)) => unit,
                _ => break,
            };
            if !units.is_empty() {
                if total + next.size > cap {
                    break;
                }
                // A batch holds exactly one subtask key.
                if units[0].job.subtask_key != next.job.subtask_key {
                    break;
                }
            }
            match self.requests.dequeue() {
                Some(QueueEntry::Request(unit)) => {
                    total += unit.size;
                    units.push(unit);
                }
                _ => break,
            }
        }

        let batch = Batch::from_units(self.id, &self.job.task_key, self.job.args.clone(), units);
        Some(Dispatch::Grouped(batch))
    }
}
