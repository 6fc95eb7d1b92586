use std::collections::HashMap;
use std::time::Instant;

use crate::rpc::Peer;

/// Connection and liveness state for one registered worker
#[derive(Clone)]
pub struct WorkerState {
    pub key: String,
    pub peer: Peer,
    pub last_heartbeat: Instant,
}

impl WorkerState {
    pub fn new(key: impl Into<String>, peer: Peer) -> Self {
        Self {
            key: key.into(),
            peer,
            last_heartbeat: Instant::now(),
        }
    }

    pub fn update_heartbeat(&mut self) {
        self.last_heartbeat = Instant::now();
    }

    pub fn is_alive(&self, timeout_ms: u64) -> bool {
        !self.peer.is_closed() && self.last_heartbeat.elapsed().as_millis() < timeout_ms as u128
    }
}

/// All workers currently logged in to the master
pub struct WorkerPool {
    workers: HashMap<String, WorkerState>,
    worker_timeout_ms: u64,
}

impl WorkerPool {
    pub fn new(worker_timeout_ms: u64) -> Self {
        Self {
            workers: HashMap::new(),
            worker_timeout_ms,
        }
    }

    /// Register a newly logged-in worker. A re-login replaces the stale
    /// session from before the reconnect.
    pub fn register(&mut self, key: &str, peer: Peer) {
        self.workers
            .insert(key.to_string(), WorkerState::new(key, peer));
        tracing::info!(worker = key, "worker registered");
    }

    pub fn remove(&mut self, key: &str) {
        if self.workers.remove(key).is_some() {
            tracing::info!(worker = key, "worker removed");
        }
    }

    pub fn heartbeat(&mut self, key: &str) {
        if let Some(worker) = self.workers.get_mut(key) {
            worker.update_heartbeat();
        }
    }

    pub fn peer(&self, key: &str) -> Option<Peer> {
        self.workers.get(key).map(|w| w.peer.clone())
    }

    /// Keys of workers that are connected and heartbeating
    pub fn alive_keys(&self) -> Vec<String> {
        self.workers
            .values()
            .filter(|w| w.is_alive(self.worker_timeout_ms))
            .map(|w| w.key.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
