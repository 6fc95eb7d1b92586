use std::time::Duration;

use serde_json::json;

use crate::rpc::Peer;

/// Heartbeat sender that periodically pings the master over a session
pub struct HeartbeatSender {
    interval: Duration,
    worker_key: String,
}

impl HeartbeatSender {
    pub fn new(interval_ms: u64, worker_key: &str) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms),
            worker_key: worker_key.to_string(),
        }
    }

    /// Run the heartbeat sender over the given session until it closes
    pub async fn run(&self, peer: Peer) {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            interval.tick().await;
            if peer.is_closed() {
                break;
            }
            if peer
                .notify("heartbeat", json!({ "worker": self.worker_key }))
                .is_err()
            {
                // Session gone, stop sending
                break;
            }
        }
    }
}
