//! Run-scoped statistics: counters collected during the run and the recorder
//! that turns them into exactly one durable summary row per job.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::{error, info};

use crate::{PipelineError, RunStats};

pub const ITEM_SCRAPED_COUNT: &str = "item_scraped_count";
pub const RESPONSE_RECEIVED_COUNT: &str = "response_received_count";
pub const TARGET_COUNT: &str = "target_count";
pub const CAPTURE_ERROR_COUNT: &str = "capture_error_count";
pub const COMPRESSION_ERROR_COUNT: &str = "compression_error_count";
pub const STORE_ERROR_COUNT: &str = "store_error_count";
pub const RECORD_ERROR_COUNT: &str = "record_error_count";
pub const RECORD_DUPLICATE_COUNT: &str = "record_duplicate_count";
pub const OTHER_ERROR_COUNT: &str = "other_error_count";

/// Named counters aggregated over the whole run.
#[derive(Debug, Default)]
pub struct RunCounters {
    inner: Mutex<BTreeMap<String, i64>>,
}

impl RunCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, key: &str) {
        self.add(key, 1);
    }

    pub fn add(&self, key: &str, amount: i64) {
        let mut inner = self.inner.lock().unwrap();
        *inner.entry(key.to_string()).or_insert(0) += amount;
    }

    pub fn set(&self, key: &str, value: i64) {
        self.inner.lock().unwrap().insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> i64 {
        self.inner.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        self.inner.lock().unwrap().clone()
    }
}

/// Durable destination for the run summary row.
///
/// `open` failures are fatal to the run; `insert_run` failures are lossy
/// telemetry. `close` always runs, whatever the write outcome.
#[async_trait]
pub trait RunStatsStore: Send + Sync {
    async fn open(&self) -> Result<(), PipelineError>;
    async fn insert_run(&self, row: &RunStats) -> Result<(), PipelineError>;
    async fn close(&self);
}

/// Builds and writes the one summary row per job.
///
/// Driven by explicit run lifecycle events from the orchestrator rather than
/// any host framework signal system.
pub struct StatsRecorder {
    job_id: String,
    store: std::sync::Arc<dyn RunStatsStore>,
    counters: std::sync::Arc<RunCounters>,
    started_at: Mutex<Option<DateTime<Utc>>>,
}

impl StatsRecorder {
    pub fn new(
        job_id: String,
        store: std::sync::Arc<dyn RunStatsStore>,
        counters: std::sync::Arc<RunCounters>,
    ) -> Self {
        Self {
            job_id,
            store,
            counters,
            started_at: Mutex::new(None),
        }
    }

    /// Establish the stats store connection. Failure here aborts the run.
    pub async fn on_run_start(&self) -> Result<(), PipelineError> {
        self.store.open().await?;
        *self.started_at.lock().unwrap() = Some(Utc::now());
        info!("stats recorder connected for job {}", self.job_id);
        Ok(())
    }

    /// Write the summary row and release the connection.
    ///
    /// A write failure is logged and swallowed: the run is already logically
    /// complete, so this is lossy telemetry, not a run failure.
    pub async fn on_run_end(&self, finish_reason: &str) {
        let row = self.build_row(finish_reason);

        match self.store.insert_run(&row).await {
            Ok(()) => info!(
                "run stats recorded for job {}: {} items, reason {}",
                row.job_id, row.item_scraped_count, row.finish_reason
            ),
            Err(e) => error!("failed to record run stats for job {}: {e}", row.job_id),
        }

        self.store.close().await;
    }

    fn build_row(&self, finish_reason: &str) -> RunStats {
        let started_at = self
            .started_at
            .lock()
            .unwrap()
            .unwrap_or_else(Utc::now);
        let finished_at = Utc::now();
        let elapsed = (finished_at - started_at)
            .to_std()
            .unwrap_or_default()
            .as_secs_f64();
        let minutes = elapsed / 60.0;

        let items = self.counters.get(ITEM_SCRAPED_COUNT);
        let responses = self.counters.get(RESPONSE_RECEIVED_COUNT);
        let per_minute = |count: i64| {
            if minutes > 0.0 {
                count as f64 / minutes
            } else {
                0.0
            }
        };

        let mut snapshot = serde_json::Map::new();
        snapshot.insert("job_id".to_string(), self.job_id.clone().into());
        snapshot.insert("start_time".to_string(), started_at.to_rfc3339().into());
        snapshot.insert("finish_time".to_string(), finished_at.to_rfc3339().into());
        snapshot.insert("elapsed_time_seconds".to_string(), elapsed.into());
        snapshot.insert("finish_reason".to_string(), finish_reason.into());
        for (key, value) in self.counters.snapshot() {
            snapshot.insert(key, value.into());
        }

        RunStats {
            job_id: self.job_id.clone(),
            started_at,
            finished_at,
            elapsed_time_seconds: elapsed,
            item_scraped_count: items,
            finish_reason: finish_reason.to_string(),
            responses_per_minute: per_minute(responses),
            items_per_minute: per_minute(items),
            stats: serde_json::Value::Object(snapshot),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counters_accumulate() {
        let counters = RunCounters::new();
        counters.inc(ITEM_SCRAPED_COUNT);
        counters.inc(ITEM_SCRAPED_COUNT);
        counters.add(CAPTURE_ERROR_COUNT, 3);
        counters.set(TARGET_COUNT, 5);

        assert_eq!(counters.get(ITEM_SCRAPED_COUNT), 2);
        assert_eq!(counters.get(CAPTURE_ERROR_COUNT), 3);
        assert_eq!(counters.get(TARGET_COUNT), 5);
        assert_eq!(counters.get("never_touched"), 0);

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[ITEM_SCRAPED_COUNT], 2);
    }

    struct NullStore;

    #[async_trait]
    impl RunStatsStore for NullStore {
        async fn open(&self) -> Result<(), PipelineError> {
            Ok(())
        }
        async fn insert_run(&self, _row: &RunStats) -> Result<(), PipelineError> {
            Ok(())
        }
        async fn close(&self) {}
    }

    #[tokio::test]
    async fn row_carries_counters_and_reason() {
        let counters = Arc::new(RunCounters::new());
        counters.set(ITEM_SCRAPED_COUNT, 2);
        counters.set(RESPONSE_RECEIVED_COUNT, 3);
        counters.set(TARGET_COUNT, 3);

        let recorder = StatsRecorder::new("job-1".to_string(), Arc::new(NullStore), counters);
        recorder.on_run_start().await.unwrap();
        let row = recorder.build_row("finished_with_failures");

        assert_eq!(row.job_id, "job-1");
        assert_eq!(row.item_scraped_count, 2);
        assert_eq!(row.finish_reason, "finished_with_failures");
        assert!(row.elapsed_time_seconds >= 0.0);

        let stats = row.stats.as_object().unwrap();
        assert_eq!(stats["job_id"], "job-1");
        assert_eq!(stats["item_scraped_count"], 2);
        assert_eq!(stats["response_received_count"], 3);
        assert_eq!(stats["finish_reason"], "finished_with_failures");
    }
}
