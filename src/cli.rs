//! Command-line interface: argument parsing, config overrides and command
//! dispatch.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::{
    db, sink, BrowserPool, CaptureEngine, Capturer, Config, MetadataRecorder, PgMetadataRecorder,
    PgRunStatsStore, PipelineError, PipelineOrchestrator, RunCounters, RunReport, RunStatsStore,
    TargetLocationRepo,
};

#[derive(Parser)]
#[command(name = "gmaps-screenshot-engine")]
#[command(about = "Captures, compresses and stores map screenshots for target locations")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Browser pool size")]
    pub pool_size: Option<usize>,

    #[arg(long, help = "Capture timeout in seconds")]
    pub capture_timeout: Option<u64>,

    #[arg(long, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Capture every active target location
    Run {
        #[arg(long, help = "Only capture targets in this folder")]
        folder: Option<String>,

        #[arg(long, help = "Use a fixed job id instead of a generated one")]
        job_id: Option<String>,
    },

    /// Apply pending database migrations
    Migrate,

    /// Load and validate the configuration, then exit
    Validate,
}

pub struct CliRunner {
    pub config: Config,
}

impl CliRunner {
    /// Load the config file, apply CLI overrides, validate.
    pub async fn new(args: &Cli) -> Result<Self, PipelineError> {
        let mut config = Config::load(args.config.as_ref()).await?;

        if let Some(pool_size) = args.pool_size {
            config.browser_pool_size = pool_size;
        }
        if let Some(timeout) = args.capture_timeout {
            config.capture_timeout = Duration::from_secs(timeout);
        }
        if let Some(chrome_path) = &args.chrome_path {
            config.chrome_path = Some(chrome_path.clone());
        }

        config.validate()?;
        info!(
            "configuration loaded: pool size {}, capture timeout {:?}",
            config.browser_pool_size, config.capture_timeout
        );

        Ok(Self { config })
    }

    pub async fn run(
        &self,
        command: Commands,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Option<RunReport>, PipelineError> {
        match command {
            Commands::Run { folder, job_id } => self
                .run_pipeline(folder, job_id, shutdown)
                .await
                .map(Some),
            Commands::Migrate => {
                let pool = db::connect(&self.config.database).await?;
                db::run_migrations(&pool).await?;
                pool.close().await;
                Ok(None)
            }
            Commands::Validate => {
                info!("configuration is valid");
                Ok(None)
            }
        }
    }

    /// Wire the full pipeline and drive one run.
    async fn run_pipeline(
        &self,
        folder: Option<String>,
        job_id: Option<String>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<RunReport, PipelineError> {
        let pool = db::connect(&self.config.database).await?;

        let mut targets = TargetLocationRepo::list_active(&pool).await?;
        if let Some(folder) = &folder {
            targets.retain(|t| &t.folder == folder);
        }
        if targets.is_empty() {
            warn!("no active targets to capture");
        }

        let browser_pool = BrowserPool::new(self.config.clone()).await?;
        let capturer: Arc<dyn Capturer> = Arc::new(CaptureEngine::new(
            browser_pool,
            self.config.capture_timeout,
            self.config.render_settle,
            shutdown.clone(),
        ));
        let artifact_sink = sink::from_config(&self.config.storage).await;
        let recorder: Arc<dyn MetadataRecorder> = Arc::new(PgMetadataRecorder::new(pool.clone()));
        let stats_store: Arc<dyn RunStatsStore> =
            Arc::new(PgRunStatsStore::new(self.config.database.clone()));
        let counters = Arc::new(RunCounters::new());

        let orchestrator = match job_id {
            Some(job_id) => PipelineOrchestrator::with_job_id(
                job_id,
                capturer,
                artifact_sink,
                recorder,
                stats_store,
                counters,
                self.config.gmaps_base_url.clone(),
                self.config.browser_pool_size,
            ),
            None => PipelineOrchestrator::new(
                capturer,
                artifact_sink,
                recorder,
                stats_store,
                counters,
                self.config.gmaps_base_url.clone(),
                self.config.browser_pool_size,
            ),
        };

        let report = orchestrator.run(targets, shutdown).await;
        pool.close().await;
        report
    }
}

pub fn setup_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();
}
