//! Streaming per-task statistics.
//!
//! Aggregates are maintained with Welford's running formulation so no job
//! history is ever re-scanned. Records are accounted at most once: each
//! task bucket keeps a monotonically increasing cursor of the highest
//! record sequence it has folded in, and replays below it are skipped.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Numerically stable running aggregate over observed durations.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
    sum: f64,
}

impl RunningStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one new sample into the aggregate.
    pub fn tick(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
        self.sum += x;
        if self.count == 1 {
            self.min = x;
            self.max = x;
        } else {
            self.min = self.min.min(x);
            self.max = self.max.max(x);
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// -1.0 sentinel when no samples have been observed.
    pub fn min(&self) -> f64 {
        if self.count == 0 {
            -1.0
        } else {
            self.min
        }
    }

    pub fn max(&self) -> f64 {
        if self.count == 0 {
            -1.0
        } else {
            self.max
        }
    }

    /// Sample variance, or the -1.0 sentinel when undefined (fewer than two
    /// samples).
    pub fn variance(&self) -> f64 {
        if self.count > 1 {
            self.m2 / (self.count - 1) as f64
        } else {
            -1.0
        }
    }

    pub fn std_dev(&self) -> f64 {
        let variance = self.variance();
        if variance < 0.0 {
            -1.0
        } else {
            variance.sqrt()
        }
    }

    pub fn summary(&self) -> Value {
        json!({
            "num_completed": self.count(),
            "mean": self.mean(),
            "variance": self.variance(),
            "std_dev": self.std_dev(),
            "min": self.min(),
            "max": self.max(),
            "summed_time": self.sum(),
        })
    }
}

/// A completed job as the statistics engine sees it. `seq` is assigned
/// monotonically when the record is archived and drives the replay cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedJob {
    pub seq: u64,
    pub task_key: String,
    pub subtask_key: Option<String>,
    pub worker: String,
    pub version: String,
    pub started: DateTime<Utc>,
    pub completed: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct TaskBucket {
    overall: RunningStats,
    subtasks: HashMap<String, RunningStats>,
    workers: HashMap<String, RunningStats>,
    versions: HashMap<String, RunningStats>,
    /// Highest record sequence folded into this bucket.
    cursor: u64,
}

impl TaskBucket {
    fn summary(&self) -> Value {
        json!({
            "stats": self.overall.summary(),
            "subtasks": map_summaries(&self.subtasks),
            "workers": map_summaries(&self.workers),
            "versions": map_summaries(&self.versions),
        })
    }
}

fn map_summaries(map: &HashMap<String, RunningStats>) -> Value {
    Value::Object(
        map.iter()
            .map(|(key, stats)| (key.clone(), stats.summary()))
            .collect(),
    )
}

/// Query shape for the statistics surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsQuery {
    #[serde(default)]
    pub task_key: Option<String>,
    #[serde(default)]
    pub subtask_key: Option<String>,
    #[serde(default)]
    pub worker: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// All per-task statistics buckets.
#[derive(Debug, Default)]
pub struct StatsRegistry {
    tasks: HashMap<String, TaskBucket>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one completed job into the aggregates.
    ///
    /// Returns false when the record was skipped: already accounted for,
    /// or malformed (completion before start must not corrupt the running
    /// aggregate).
    pub fn update(&mut self, record: &CompletedJob) -> bool {
        let bucket = self.tasks.entry(record.task_key.clone()).or_default();
        if record.seq <= bucket.cursor {
            tracing::debug!(
                task = %record.task_key,
                seq = record.seq,
                cursor = bucket.cursor,
                "record already accounted for, skipping"
            );
            return false;
        }
        // Advance the cursor even for rejected records so a replay does
        // not retry them forever.
        bucket.cursor = record.seq;

        let elapsed = (record.completed - record.started).num_seconds();
        if elapsed < 0 {
            tracing::warn!(
                task = %record.task_key,
                seq = record.seq,
                elapsed,
                "rejecting job record with completion before start"
            );
            return false;
        }
        let elapsed = elapsed as f64;

        bucket.overall.tick(elapsed);
        if let Some(subtask) = &record.subtask_key {
            bucket
                .subtasks
                .entry(subtask.clone())
                .or_default()
                .tick(elapsed);
        }
        bucket
            .workers
            .entry(record.worker.clone())
            .or_default()
            .tick(elapsed);
        bucket
            .versions
            .entry(record.version.clone())
            .or_default()
            .tick(elapsed);
        true
    }

    /// Resolve a statistics query to a nested mapping.
    ///
    /// No task key returns the full top-level mapping; unknown keys return
    /// an empty object rather than failing.
    pub fn query(&self, query: &StatsQuery) -> Value {
        let task_key = match &query.task_key {
            Some(key) => key,
            None => {
                return Value::Object(
                    self.tasks
                        .iter()
                        .map(|(key, bucket)| (key.clone(), bucket.summary()))
                        .collect(),
                );
            }
        };

        let bucket = match self.tasks.get(task_key) {
            Some(bucket) => bucket,
            None => return json!({}),
        };

        if let Some(subtask) = &query.subtask_key {
            return bucket
                .subtasks
                .get(subtask)
                .map(|stats| stats.summary())
                .unwrap_or_else(|| json!({}));
        }
        if let Some(worker) = &query.worker {
            return bucket
                .workers
                .get(worker)
                .map(|stats| stats.summary())
                .unwrap_or_else(|| json!({}));
        }
        if let Some(version) = &query.version {
            return bucket
                .versions
                .get(version)
                .map(|stats| stats.summary())
                .unwrap_or_else(|| json!({}));
        }
        bucket.summary()
    }
}

/// Storage seam for catch-up after a restart: completed jobs the engine has
/// not yet observed, in sequence order.
#[async_trait]
pub trait CompletedJobSource: Send + Sync {
    async fn completed_since(&self, seq: u64) -> Vec<CompletedJob>;
}

/// Drive the registry from job-finished notifications, with a periodic
/// catch-up scan over the source for records the push path missed.
pub async fn run_engine(
    registry: Arc<RwLock<StatsRegistry>>,
    mut rx: mpsc::UnboundedReceiver<CompletedJob>,
    source: Arc<dyn CompletedJobSource>,
    tick: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(tick);
    // Floor of the periodic scan; per-task cursors still guard every fold.
    let mut replay_floor = 0u64;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            record = rx.recv() => {
                let Some(record) = record else { break };
                replay_floor = replay_floor.max(record.seq);
                registry.write().expect("lock poisoned").update(&record);
            }

            _ = interval.tick() => {
                let records = source.completed_since(replay_floor).await;
                if records.is_empty() {
                    continue;
                }
                let mut registry = registry.write().expect("lock poisoned");
                for record in records {
                    replay_floor = replay_floor.max(record.seq);
                    registry.update(&record);
                }
            }
        }
    }
    tracing::debug!("statistics engine stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_stats_empty_sentinels() {
        let stats = RunningStats::new();
        assert_eq!(stats.count(), 0);
        assert_eq!(stats.variance(), -1.0);
        assert_eq!(stats.std_dev(), -1.0);
        assert_eq!(stats.min(), -1.0);
        assert_eq!(stats.max(), -1.0);
    }

    #[test]
    fn running_stats_single_sample() {
        let mut stats = RunningStats::new();
        stats.tick(7.0);
        assert_eq!(stats.count(), 1);
        assert_eq!(stats.mean(), 7.0);
        assert_eq!(stats.min(), 7.0);
        assert_eq!(stats.max(), 7.0);
        // variance undefined with one sample
        assert_eq!(stats.variance(), -1.0);
    }

    #[test]
    fn running_stats_matches_batch_formula() {
        let mut stats = RunningStats::new();
        for x in [4.0, 7.0, 13.0, 16.0] {
            stats.tick(x);
        }
        assert_eq!(stats.count(), 4);
        assert!((stats.mean() - 10.0).abs() < 1e-9);
        assert!((stats.variance() - 30.0).abs() < 1e-9);
        assert!((stats.std_dev() - 30.0f64.sqrt()).abs() < 1e-9);
        assert_eq!(stats.min(), 4.0);
        assert_eq!(stats.max(), 16.0);
        assert_eq!(stats.sum(), 40.0);
    }
}
