//! Pipeline orchestration: per-target control flow and run lifecycle.
//!
//! The orchestrator owns sequencing only and holds no durable state. One job
//! id is generated at construction and threaded unchanged into every
//! artifact record and the final stats row. Failure at any step
//! short-circuits that target alone; other targets and the run itself keep
//! going.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::capture::wait_cancelled;
use crate::{
    gmaps, processor, stats, ArtifactRecord, ArtifactSink, Capturer, CompressedArtifact,
    MetadataRecorder, PipelineError, RecordOutcome, RenderedFrame, RunCounters, RunStatsStore,
    StatsRecorder, TargetLocation, TargetReport, TargetState,
};

/// Summary of one finished run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub job_id: String,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Targets never admitted because the run was cancelled first.
    pub skipped: usize,
    pub finish_reason: String,
}

#[derive(Clone)]
pub struct PipelineOrchestrator {
    capturer: Arc<dyn Capturer>,
    sink: Arc<dyn ArtifactSink>,
    recorder: Arc<dyn MetadataRecorder>,
    stats: Arc<StatsRecorder>,
    counters: Arc<RunCounters>,
    job_id: String,
    base_url: String,
    /// Caps simultaneously open render resources; sized to the browser pool.
    capture_slots: Arc<Semaphore>,
    /// Caps concurrent compressions; sized to available CPU cores.
    compress_slots: Arc<Semaphore>,
}

impl PipelineOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        capturer: Arc<dyn Capturer>,
        sink: Arc<dyn ArtifactSink>,
        recorder: Arc<dyn MetadataRecorder>,
        stats_store: Arc<dyn RunStatsStore>,
        counters: Arc<RunCounters>,
        base_url: String,
        capture_concurrency: usize,
    ) -> Self {
        Self::with_job_id(
            Uuid::new_v4().to_string(),
            capturer,
            sink,
            recorder,
            stats_store,
            counters,
            base_url,
            capture_concurrency,
        )
    }

    /// Callers must guarantee job-id uniqueness per run; `new` does so by
    /// generating a fresh UUID.
    #[allow(clippy::too_many_arguments)]
    pub fn with_job_id(
        job_id: String,
        capturer: Arc<dyn Capturer>,
        sink: Arc<dyn ArtifactSink>,
        recorder: Arc<dyn MetadataRecorder>,
        stats_store: Arc<dyn RunStatsStore>,
        counters: Arc<RunCounters>,
        base_url: String,
        capture_concurrency: usize,
    ) -> Self {
        let stats = Arc::new(StatsRecorder::new(
            job_id.clone(),
            stats_store,
            counters.clone(),
        ));

        Self {
            capturer,
            sink,
            recorder,
            stats,
            counters,
            job_id,
            base_url,
            capture_slots: Arc::new(Semaphore::new(capture_concurrency.max(1))),
            compress_slots: Arc::new(Semaphore::new(num_cpus::get().max(1))),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Drive the whole run: stats connection up front (fatal on failure),
    /// one task per target under the capture cap, render resources released,
    /// then exactly one stats row whatever happened in between.
    pub async fn run(
        &self,
        targets: Vec<TargetLocation>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<RunReport, PipelineError> {
        self.stats.on_run_start().await?;

        let total = targets.len();
        self.counters.set(stats::TARGET_COUNT, total as i64);
        info!("job {} starting with {total} targets", self.job_id);

        let mut handles = Vec::with_capacity(total);
        for target in targets {
            if *shutdown.borrow() {
                warn!("shutdown requested, admitting no further targets");
                break;
            }

            let mut cancel = shutdown.clone();
            let permit = tokio::select! {
                permit = self.capture_slots.clone().acquire_owned() => {
                    match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    }
                }
                _ = wait_cancelled(&mut cancel) => break,
            };

            let this = self.clone();
            handles.push(tokio::spawn(async move {
                let _capture_slot = permit;
                this.process_target(target).await
            }));
        }

        let mut reports = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(report) => reports.push(report),
                Err(e) => error!("target task panicked: {e}"),
            }
        }

        let succeeded = reports.iter().filter(|r| r.succeeded()).count();
        let failed = reports.len() - succeeded;
        let skipped = total - reports.len();

        // All render resources must be gone before the stats row is written.
        self.capturer.shutdown().await;

        let finish_reason = if *shutdown.borrow() {
            "shutdown"
        } else if failed > 0 || skipped > 0 {
            "finished_with_failures"
        } else {
            "finished"
        };
        self.stats.on_run_end(finish_reason).await;

        info!(
            "job {} finished: {succeeded} succeeded, {failed} failed, {skipped} skipped ({finish_reason})",
            self.job_id
        );

        Ok(RunReport {
            job_id: self.job_id.clone(),
            total,
            succeeded,
            failed,
            skipped,
            finish_reason: finish_reason.to_string(),
        })
    }

    /// One target's trip through the state machine. Never returns an error;
    /// failures are folded into the report and the run counters.
    async fn process_target(&self, target: TargetLocation) -> TargetReport {
        let url = gmaps::map_url(&self.base_url, &target);
        debug!("dispatching target {} ({}) -> {url}", target.id, target.name);

        let mut state = TargetState::Pending;
        match self.run_target_steps(&target, &url, &mut state).await {
            Ok(()) => {
                debug!("target {} ({}) done", target.id, target.name);
                TargetReport {
                    target_id: target.id,
                    name: target.name,
                    state: TargetState::Done,
                    error: None,
                }
            }
            Err(e) => {
                self.counters.inc(e.counter_key());
                warn!(
                    "target {} ({}) failed after reaching {state}: {e}",
                    target.id, target.name
                );
                TargetReport {
                    target_id: target.id,
                    name: target.name,
                    state: TargetState::Failed,
                    error: Some(e),
                }
            }
        }
    }

    async fn run_target_steps(
        &self,
        target: &TargetLocation,
        url: &str,
        state: &mut TargetState,
    ) -> Result<(), PipelineError> {
        let frame = self.capturer.capture(target, url).await?;
        *state = TargetState::Captured;
        self.counters.inc(stats::RESPONSE_RECEIVED_COUNT);

        let artifact = self.compress_frame(frame).await?;
        *state = TargetState::Compressed;

        let key = gmaps::artifact_key(target, &self.job_id);
        self.sink.store(&key, &artifact.bytes).await?;
        *state = TargetState::Stored;

        let record = ArtifactRecord {
            target_location_id: target.id,
            parent_folder: target.folder.clone(),
            file_path: key,
            size: artifact.size() as i64,
            job_id: self.job_id.clone(),
            captured_at: Utc::now(),
        };
        if self.recorder.record_artifact(&record).await? == RecordOutcome::AlreadyExists {
            self.counters.inc(stats::RECORD_DUPLICATE_COUNT);
            debug!("metadata row already present for {}", record.file_path);
        }
        *state = TargetState::Recorded;

        self.counters.inc(stats::ITEM_SCRAPED_COUNT);
        *state = TargetState::Done;
        Ok(())
    }

    /// CPU-bound transform on the blocking pool, gated so compressions never
    /// oversubscribe the cores while captures wait on the network.
    async fn compress_frame(
        &self,
        frame: RenderedFrame,
    ) -> Result<CompressedArtifact, PipelineError> {
        let _cpu_slot = self
            .compress_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::Compression("compression pool closed".to_string()))?;

        tokio::task::spawn_blocking(move || processor::compress(&frame.png))
            .await
            .map_err(|e| PipelineError::Compression(format!("compression task: {e}")))?
    }
}
