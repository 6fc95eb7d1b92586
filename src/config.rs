use std::net::SocketAddr;

/// Configuration for a master node.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub listen_addr: SocketAddr,
    /// Shared secret workers and clients must present at login.
    pub secret: String,
    /// Target batch size for coalescing queued work requests.
    pub batch_target: u32,
    /// Interval of the work distribution loop.
    pub assign_interval_ms: u64,
    /// Interval of the statistics catch-up tick.
    pub stats_interval_ms: u64,
    /// Timeout applied to each remote call a master makes to a worker.
    pub call_timeout_ms: u64,
    /// A worker with no heartbeat for this long is considered dead.
    pub worker_timeout_ms: u64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:18800"
                .parse()
                .expect("default listen address is valid"),
            secret: String::new(),
            batch_target: 5,
            assign_interval_ms: 100,
            stats_interval_ms: 2000,
            call_timeout_ms: 5000,
            worker_timeout_ms: 5000,
        }
    }
}

impl MasterConfig {
    pub fn new(listen_addr: SocketAddr, secret: impl Into<String>) -> Self {
        Self {
            listen_addr,
            secret: secret.into(),
            ..Default::default()
        }
    }

    pub fn with_batch_target(mut self, target: u32) -> Self {
        self.batch_target = target;
        self
    }
}

/// Configuration for a worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Master address in host:port form.
    pub master_addr: String,
    /// Key identifying this worker to the master.
    pub worker_key: String,
    /// Shared secret presented at login.
    pub secret: String,
    /// Timeout applied to each remote call made to the master.
    pub call_timeout_ms: u64,
    /// Interval between heartbeats while connected.
    pub heartbeat_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            master_addr: "127.0.0.1:18800".to_string(),
            worker_key: "worker-1".to_string(),
            secret: String::new(),
            call_timeout_ms: 5000,
            heartbeat_interval_ms: 500,
        }
    }
}

impl WorkerConfig {
    pub fn new(
        master_addr: impl Into<String>,
        worker_key: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            master_addr: master_addr.into(),
            worker_key: worker_key.into(),
            secret: secret.into(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_config_default() {
        let cfg = MasterConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:18800");
        assert_eq!(cfg.batch_target, 5);
        assert_eq!(cfg.assign_interval_ms, 100);
        assert_eq!(cfg.stats_interval_ms, 2000);
        assert!(cfg.secret.is_empty());
    }

    #[test]
    fn master_config_new() {
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let cfg = MasterConfig::new(addr, "hunter2");
        assert_eq!(cfg.listen_addr, addr);
        assert_eq!(cfg.secret, "hunter2");
        assert_eq!(cfg.batch_target, 5);
    }

    #[test]
    fn master_config_with_batch_target() {
        let cfg = MasterConfig::default().with_batch_target(20);
        assert_eq!(cfg.batch_target, 20);
    }

    #[test]
    fn worker_config_default() {
        let cfg = WorkerConfig::default();
        assert_eq!(cfg.master_addr, "127.0.0.1:18800");
        assert_eq!(cfg.worker_key, "worker-1");
        assert_eq!(cfg.heartbeat_interval_ms, 500);
    }

    #[test]
    fn worker_config_new() {
        let cfg = WorkerConfig::new("master.example.com:18800", "w7", "hunter2");
        assert_eq!(cfg.master_addr, "master.example.com:18800");
        assert_eq!(cfg.worker_key, "w7");
        assert_eq!(cfg.secret, "hunter2");
    }
}
