//! Postgres access: pool construction, embedded migrations, the target
//! location provider, the idempotent artifact metadata recorder and the
//! run-stats store.

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use tokio::sync::Mutex;
use tracing::info;

use crate::{ArtifactRecord, DbConfig, PipelineError, RunStats, RunStatsStore, TargetLocation};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

fn connect_options(db: &DbConfig) -> PgConnectOptions {
    PgConnectOptions::new()
        .host(&db.host)
        .port(db.port)
        .username(&db.user)
        .password(&db.password)
        .database(&db.database)
}

/// Open the metadata store pool. Unreachable store at run start is fatal.
pub async fn connect(db: &DbConfig) -> Result<PgPool, PipelineError> {
    PgPoolOptions::new()
        .max_connections(db.max_connections)
        .connect_with(connect_options(db))
        .await
        .map_err(|e| PipelineError::Connection(e.to_string()))
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), PipelineError> {
    MIGRATOR
        .run(pool)
        .await
        .map_err(|e| PipelineError::Connection(format!("migrations: {e}")))?;
    info!("migrations applied");
    Ok(())
}

/// Read-only provider of the targets to visit this run.
pub struct TargetLocationRepo;

impl TargetLocationRepo {
    /// Only rows with `active = true` feed the pipeline.
    pub async fn list_active(pool: &PgPool) -> Result<Vec<TargetLocation>, PipelineError> {
        sqlx::query_as::<_, TargetLocation>(
            "SELECT id, name, description, folder, address, link,
                    latitude, longitude, gmaps_zoom, gmaps_extra_params,
                    active, created_at, updated_at
             FROM target_locations
             WHERE active = true
             ORDER BY id",
        )
        .fetch_all(pool)
        .await
        .map_err(|e| PipelineError::Connection(format!("list targets: {e}")))
    }
}

/// Outcome of one metadata insert attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted,
    /// A row with the same `file_path` already exists. Success, not an
    /// error; nothing was mutated.
    AlreadyExists,
}

/// Idempotent upsert of one artifact-metadata row, keyed by storage path.
#[async_trait]
pub trait MetadataRecorder: Send + Sync {
    async fn record_artifact(&self, record: &ArtifactRecord)
        -> Result<RecordOutcome, PipelineError>;
}

pub struct PgMetadataRecorder {
    pool: PgPool,
}

impl PgMetadataRecorder {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MetadataRecorder for PgMetadataRecorder {
    /// `ON CONFLICT (file_path) DO NOTHING`: a duplicate path is a no-op, so
    /// recording is safe to retry after a partial failure as long as the key
    /// derivation stays deterministic.
    async fn record_artifact(
        &self,
        record: &ArtifactRecord,
    ) -> Result<RecordOutcome, PipelineError> {
        let result = sqlx::query(
            "INSERT INTO gmaps_screenshots
                (target_location_id, parent_folder, file_path, size, job_id, captured_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (file_path) DO NOTHING",
        )
        .bind(record.target_location_id)
        .bind(&record.parent_folder)
        .bind(&record.file_path)
        .bind(record.size)
        .bind(&record.job_id)
        .bind(record.captured_at)
        .execute(&self.pool)
        .await
        .map_err(|e| PipelineError::Record(e.to_string()))?;

        if result.rows_affected() == 1 {
            Ok(RecordOutcome::Inserted)
        } else {
            Ok(RecordOutcome::AlreadyExists)
        }
    }
}

/// Run-stats store over its own single-connection pool, opened at run start
/// and closed at run end regardless of write outcome. Keeping it separate
/// from the metadata pool avoids lifecycle coupling between the two paths.
pub struct PgRunStatsStore {
    db: DbConfig,
    pool: Mutex<Option<PgPool>>,
}

impl PgRunStatsStore {
    pub fn new(db: DbConfig) -> Self {
        Self {
            db,
            pool: Mutex::new(None),
        }
    }
}

#[async_trait]
impl RunStatsStore for PgRunStatsStore {
    async fn open(&self) -> Result<(), PipelineError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options(&self.db))
            .await
            .map_err(|e| PipelineError::Connection(e.to_string()))?;
        *self.pool.lock().await = Some(pool);
        Ok(())
    }

    async fn insert_run(&self, row: &RunStats) -> Result<(), PipelineError> {
        let guard = self.pool.lock().await;
        let pool = guard
            .as_ref()
            .ok_or_else(|| PipelineError::StatsWrite("stats store not opened".to_string()))?;

        sqlx::query(
            "INSERT INTO scrapy_run_stats
                (job_id, started_at, finished_at, elapsed_time_seconds,
                 item_scraped_count, finish_reason, responses_per_minute,
                 items_per_minute, stats)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(&row.job_id)
        .bind(row.started_at)
        .bind(row.finished_at)
        .bind(row.elapsed_time_seconds)
        .bind(row.item_scraped_count)
        .bind(&row.finish_reason)
        .bind(row.responses_per_minute)
        .bind(row.items_per_minute)
        .bind(&row.stats)
        .execute(pool)
        .await
        .map_err(|e| PipelineError::StatsWrite(e.to_string()))?;

        Ok(())
    }

    async fn close(&self) {
        if let Some(pool) = self.pool.lock().await.take() {
            pool.close().await;
            info!("stats store connection closed");
        }
    }
}
