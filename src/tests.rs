#[cfg(test)]
mod pipeline_tests {
    use crate::model::test_target;
    use crate::{
        ArtifactRecord, ArtifactSink, Capturer, MetadataRecorder, MockCapturer, PipelineError,
        PipelineOrchestrator, RecordOutcome, RenderedFrame, RunCounters, RunStats, RunStatsStore,
        TargetLocation,
    };
    use async_trait::async_trait;
    use image::{Rgb, RgbImage};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::watch;

    const BASE_URL: &str = "https://www.google.com";

    /// Synthetic capture payload: a small gradient PNG.
    fn sample_png() -> Vec<u8> {
        let img = RgbImage::from_fn(320, 180, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        });
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(
                &mut std::io::Cursor::new(&mut bytes),
                image::ImageFormat::Png,
            )
            .unwrap();
        bytes
    }

    /// Capturer that renders the sample PNG for every target except
    /// `fail_id`, which times out terminally.
    fn stub_capturer(fail_id: Option<i64>) -> MockCapturer {
        let png = sample_png();
        let mut mock = MockCapturer::new();
        mock.expect_capture().returning(move |target, _url| {
            if Some(target.id) == fail_id {
                Err(PipelineError::Timeout(Duration::from_secs(45)))
            } else {
                Ok(RenderedFrame {
                    target_id: target.id,
                    png: png.clone(),
                })
            }
        });
        mock.expect_shutdown().times(1).return_const(());
        mock
    }

    /// Capturer that tracks how many render slots are held at once and that
    /// every capture gives its slot back, on success and on timeout alike.
    struct CountingCapturer {
        png: Vec<u8>,
        timeout_id: Option<i64>,
        in_flight: AtomicI64,
        max_in_flight: AtomicI64,
        releases: AtomicI64,
        shutdowns: AtomicI64,
    }

    impl CountingCapturer {
        fn new(timeout_id: Option<i64>) -> Self {
            Self {
                png: sample_png(),
                timeout_id,
                in_flight: AtomicI64::new(0),
                max_in_flight: AtomicI64::new(0),
                releases: AtomicI64::new(0),
                shutdowns: AtomicI64::new(0),
            }
        }
    }

    #[async_trait]
    impl Capturer for CountingCapturer {
        async fn capture(
            &self,
            target: &TargetLocation,
            _url: &str,
        ) -> Result<RenderedFrame, PipelineError> {
            let held = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(held, Ordering::SeqCst);

            tokio::time::sleep(Duration::from_millis(5)).await;

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.releases.fetch_add(1, Ordering::SeqCst);

            if Some(target.id) == self.timeout_id {
                Err(PipelineError::Timeout(Duration::from_secs(45)))
            } else {
                Ok(RenderedFrame {
                    target_id: target.id,
                    png: self.png.clone(),
                })
            }
        }

        async fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct MemorySink {
        files: Mutex<BTreeMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl ArtifactSink for MemorySink {
        async fn store(&self, key: &str, bytes: &[u8]) -> Result<(), PipelineError> {
            self.files
                .lock()
                .unwrap()
                .insert(key.to_string(), bytes.to_vec());
            Ok(())
        }
    }

    /// Recorder with the same conflict semantics as the Postgres one:
    /// `file_path` is the natural key and a duplicate insert is a no-op.
    #[derive(Default)]
    struct MemoryRecorder {
        rows: Mutex<BTreeMap<String, ArtifactRecord>>,
    }

    #[async_trait]
    impl MetadataRecorder for MemoryRecorder {
        async fn record_artifact(
            &self,
            record: &ArtifactRecord,
        ) -> Result<RecordOutcome, PipelineError> {
            let mut rows = self.rows.lock().unwrap();
            if rows.contains_key(&record.file_path) {
                Ok(RecordOutcome::AlreadyExists)
            } else {
                rows.insert(record.file_path.clone(), record.clone());
                Ok(RecordOutcome::Inserted)
            }
        }
    }

    #[derive(Default)]
    struct MemoryStatsStore {
        rows: Mutex<Vec<RunStats>>,
        fail_open: bool,
        opened: AtomicBool,
        closed: AtomicBool,
    }

    impl MemoryStatsStore {
        fn failing() -> Self {
            Self {
                fail_open: true,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl RunStatsStore for MemoryStatsStore {
        async fn open(&self) -> Result<(), PipelineError> {
            if self.fail_open {
                return Err(PipelineError::Connection("refused".to_string()));
            }
            self.opened.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn insert_run(&self, row: &RunStats) -> Result<(), PipelineError> {
            self.rows.lock().unwrap().push(row.clone());
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct Harness {
        sink: Arc<MemorySink>,
        recorder: Arc<MemoryRecorder>,
        stats: Arc<MemoryStatsStore>,
        counters: Arc<RunCounters>,
        orchestrator: PipelineOrchestrator,
    }

    fn harness(job_id: &str, capturer: MockCapturer, stats: Arc<MemoryStatsStore>) -> Harness {
        let sink = Arc::new(MemorySink::default());
        let recorder = Arc::new(MemoryRecorder::default());
        let counters = Arc::new(RunCounters::new());

        let orchestrator = PipelineOrchestrator::with_job_id(
            job_id.to_string(),
            Arc::new(capturer),
            sink.clone(),
            recorder.clone(),
            stats.clone(),
            counters.clone(),
            BASE_URL.to_string(),
            2,
        );

        Harness {
            sink,
            recorder,
            stats,
            counters,
            orchestrator,
        }
    }

    fn targets() -> Vec<TargetLocation> {
        vec![
            test_target(1, "Plaza Patria"),
            test_target(2, "Plaza del Sol"),
            test_target(3, "Gran Plaza"),
        ]
    }

    fn live_receiver() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn run_captures_compresses_stores_and_records() {
        let stats = Arc::new(MemoryStatsStore::default());
        let h = harness("job-1", stub_capturer(None), stats);
        let (_tx, rx) = live_receiver();

        let report = h.orchestrator.run(targets(), rx).await.unwrap();

        assert_eq!(report.total, 3);
        assert_eq!(report.succeeded, 3);
        assert_eq!(report.failed, 0);
        assert_eq!(report.finish_reason, "finished");

        let files = h.sink.files.lock().unwrap();
        let rows = h.recorder.rows.lock().unwrap();
        assert_eq!(files.len(), 3);
        assert_eq!(rows.len(), 3);

        for target in targets() {
            let key = crate::artifact_key(&target, "job-1");
            let bytes = files.get(&key).expect("artifact stored under derived key");
            assert_eq!(&bytes[..2], &[0xFF, 0xD8], "stored artifact is a JPEG");

            let row = rows.get(&key).expect("metadata row per artifact");
            assert_eq!(row.target_location_id, target.id);
            assert_eq!(row.parent_folder, target.folder);
            assert_eq!(row.job_id, "job-1");
            assert_eq!(row.size, bytes.len() as i64);
        }

        let stats_rows = h.stats.rows.lock().unwrap();
        assert_eq!(stats_rows.len(), 1);
        assert_eq!(stats_rows[0].job_id, "job-1");
        assert_eq!(stats_rows[0].item_scraped_count, 3);
        assert_eq!(stats_rows[0].finish_reason, "finished");
        assert_eq!(stats_rows[0].stats["target_count"], 3);
        assert!(h.stats.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn capture_timeout_fails_only_that_target() {
        let stats = Arc::new(MemoryStatsStore::default());
        let h = harness("job-2", stub_capturer(Some(2)), stats);
        let (_tx, rx) = live_receiver();

        let report = h.orchestrator.run(targets(), rx).await.unwrap();

        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.finish_reason, "finished_with_failures");

        assert_eq!(h.sink.files.lock().unwrap().len(), 2);
        assert_eq!(h.recorder.rows.lock().unwrap().len(), 2);
        assert_eq!(h.counters.get(crate::stats::CAPTURE_ERROR_COUNT), 1);

        let stats_rows = h.stats.rows.lock().unwrap();
        assert_eq!(stats_rows[0].item_scraped_count, 2);
        assert_eq!(stats_rows[0].stats["capture_error_count"], 1);
    }

    #[tokio::test]
    async fn render_slots_are_capped_and_released_once_per_capture() {
        let capturer = Arc::new(CountingCapturer::new(Some(4)));
        let stats = Arc::new(MemoryStatsStore::default());
        let sink = Arc::new(MemorySink::default());
        let recorder = Arc::new(MemoryRecorder::default());

        let orchestrator = PipelineOrchestrator::with_job_id(
            "job-6".to_string(),
            capturer.clone(),
            sink,
            recorder,
            stats,
            Arc::new(RunCounters::new()),
            BASE_URL.to_string(),
            2,
        );

        let targets: Vec<_> = (1..=5)
            .map(|id| test_target(id, &format!("Plaza {id}")))
            .collect();
        let (_tx, rx) = live_receiver();
        let report = orchestrator.run(targets, rx).await.unwrap();

        assert_eq!(report.succeeded, 4);
        assert_eq!(report.failed, 1);

        // One capture per target, each holding at most one slot, every slot
        // given back whether the capture succeeded or timed out.
        assert_eq!(capturer.releases.load(Ordering::SeqCst), 5);
        assert_eq!(capturer.in_flight.load(Ordering::SeqCst), 0);
        assert!(capturer.max_in_flight.load(Ordering::SeqCst) <= 2);
        assert_eq!(capturer.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rerun_with_same_job_id_records_no_duplicate_rows() {
        let stats = Arc::new(MemoryStatsStore::default());
        let h = harness("job-3", stub_capturer(None), stats);
        let (_tx, rx) = live_receiver();
        h.orchestrator.run(targets(), rx).await.unwrap();
        assert_eq!(h.recorder.rows.lock().unwrap().len(), 3);

        // Second run under the same job id hits the same storage keys.
        let second = PipelineOrchestrator::with_job_id(
            "job-3".to_string(),
            Arc::new(stub_capturer(None)),
            h.sink.clone(),
            h.recorder.clone(),
            Arc::new(MemoryStatsStore::default()),
            Arc::new(RunCounters::new()),
            BASE_URL.to_string(),
            2,
        );
        let (_tx, rx) = live_receiver();
        let report = second.run(targets(), rx).await.unwrap();

        // Duplicates are successes, not errors.
        assert_eq!(report.succeeded, 3);
        assert_eq!(h.recorder.rows.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn unreachable_stats_store_aborts_the_run() {
        let stats = Arc::new(MemoryStatsStore::failing());
        // No expectations: any capture or shutdown call would panic the test.
        let h = harness("job-4", MockCapturer::new(), stats);
        let (_tx, rx) = live_receiver();

        let err = h.orchestrator.run(targets(), rx).await.unwrap_err();
        assert!(matches!(err, PipelineError::Connection(_)));
        assert!(err.is_fatal());

        assert!(h.sink.files.lock().unwrap().is_empty());
        assert!(h.stats.rows.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelled_run_skips_remaining_targets_but_still_writes_stats() {
        let stats = Arc::new(MemoryStatsStore::default());
        let mut capturer = MockCapturer::new();
        capturer.expect_shutdown().times(1).return_const(());
        let h = harness("job-5", capturer, stats);

        let (tx, rx) = live_receiver();
        tx.send(true).unwrap();

        let report = h.orchestrator.run(targets(), rx).await.unwrap();

        assert_eq!(report.total, 3);
        assert_eq!(report.succeeded, 0);
        assert_eq!(report.skipped, 3);
        assert_eq!(report.finish_reason, "shutdown");

        assert!(h.sink.files.lock().unwrap().is_empty());
        let stats_rows = h.stats.rows.lock().unwrap();
        assert_eq!(stats_rows.len(), 1);
        assert_eq!(stats_rows[0].item_scraped_count, 0);
        assert_eq!(stats_rows[0].finish_reason, "shutdown");
        assert!(h.stats.closed.load(Ordering::SeqCst));
    }
}
