//! Configuration management with serde serialization/deserialization
//!
//! Settings come from an optional JSON file plus environment overrides for
//! the store credentials. Pipeline constants (capture viewport, output
//! resolution, palette size, JPEG quality) are deliberately not configurable;
//! they define the compression contract.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::PipelineError;

/// Main configuration for one pipeline run.
///
/// # Examples
///
/// ```rust
/// use gmaps_screenshot_engine::Config;
///
/// let config = Config {
///     browser_pool_size: 2,
///     ..Default::default()
/// };
/// assert!(config.validate().is_err()); // no database password set
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Postgres connection settings for target locations, artifact metadata
    /// and run stats.
    pub database: DbConfig,

    /// Artifact storage backend (local directory or S3 bucket).
    pub storage: StorageConfig,

    /// Base address of the maps service, e.g. `https://www.google.com.mx`.
    pub gmaps_base_url: String,

    /// Number of Chrome instances in the render pool (default: 4).
    ///
    /// Each instance holds a live browser process; this also caps the number
    /// of in-flight captures.
    pub browser_pool_size: usize,

    /// Timeout for a single capture, navigation included (default: 45s).
    ///
    /// On expiry the page is closed, the browser returned to the pool and the
    /// target marked failed.
    pub capture_timeout: Duration,

    /// Path to Chrome/Chromium executable (default: auto-detect).
    pub chrome_path: Option<String>,

    /// Extra settle time after navigation before the screenshot is taken
    /// (default: 5s). Map tiles keep streaming in after load.
    pub render_settle: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DbConfig::default(),
            storage: StorageConfig::Local {
                root: PathBuf::from("screenshots"),
            },
            gmaps_base_url: "https://www.google.com".to_string(),
            browser_pool_size: 4,
            capture_timeout: Duration::from_secs(45),
            chrome_path: None,
            render_settle: Duration::from_secs(5),
        }
    }
}

/// Postgres connection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Never serialized back out; supplied via `POSTGRES_PASSWORD`.
    #[serde(default, skip_serializing)]
    pub password: String,
    pub database: String,
    /// Pool size for the metadata store; sized to the capture concurrency so
    /// per-target inserts never queue behind each other.
    pub max_connections: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: String::new(),
            database: "gmaps".to_string(),
            max_connections: 5,
        }
    }
}

/// Artifact storage backend, selected at construction time.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    /// Write artifacts under a local directory; parents are created as
    /// needed. The write is not transactional.
    Local { root: PathBuf },
    /// Upload artifacts to an S3 bucket. Credentials come from the standard
    /// AWS provider chain.
    S3 {
        bucket: String,
        #[serde(default)]
        region: Option<String>,
    },
}

impl Config {
    /// Load configuration from an optional JSON file, then apply environment
    /// overrides.
    pub async fn load(path: Option<&PathBuf>) -> Result<Self, PipelineError> {
        let mut config = match path {
            Some(path) => {
                let content = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| PipelineError::Config(format!("read {}: {e}", path.display())))?;
                serde_json::from_str(&content)
                    .map_err(|e| PipelineError::Config(format!("parse {}: {e}", path.display())))?
            }
            None => Config::default(),
        };

        config.apply_env();
        Ok(config)
    }

    /// Environment overrides for everything operators set per deployment.
    pub fn apply_env(&mut self) {
        if let Ok(host) = env::var("POSTGRES_HOST") {
            self.database.host = host;
        }
        if let Ok(port) = env::var("POSTGRES_PORT") {
            if let Ok(port) = port.parse() {
                self.database.port = port;
            }
        }
        if let Ok(user) = env::var("POSTGRES_USER") {
            self.database.user = user;
        }
        if let Ok(password) = env::var("POSTGRES_PASSWORD") {
            self.database.password = password;
        }
        if let Ok(database) = env::var("POSTGRES_DB") {
            self.database.database = database;
        }
        if let Ok(base_url) = env::var("GMAPS_BASE_URL") {
            self.gmaps_base_url = base_url;
        }
        if let Ok(bucket) = env::var("SCREENSHOTS_S3_BUCKET") {
            self.storage = StorageConfig::S3 {
                bucket,
                region: env::var("AWS_REGION").ok(),
            };
        } else if let Ok(root) = env::var("SCREENSHOTS_LOCAL_ROOT") {
            self.storage = StorageConfig::Local {
                root: PathBuf::from(root),
            };
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.browser_pool_size == 0 {
            return Err(PipelineError::Config(
                "browser pool size must be greater than 0".to_string(),
            ));
        }
        if self.capture_timeout.is_zero() {
            return Err(PipelineError::Config(
                "capture timeout must be greater than 0".to_string(),
            ));
        }
        if self.database.password.is_empty() {
            return Err(PipelineError::Config(
                "POSTGRES_PASSWORD is not set".to_string(),
            ));
        }
        if url::Url::parse(&self.gmaps_base_url).is_err() {
            return Err(PipelineError::Config(format!(
                "gmaps_base_url is not a valid URL: {}",
                self.gmaps_base_url
            )));
        }
        if let StorageConfig::S3 { bucket, .. } = &self.storage {
            if bucket.is_empty() {
                return Err(PipelineError::Config(
                    "S3 bucket name must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Chrome command-line arguments for one pooled instance.
///
/// Unique user-data and debugging ports keep instances from tripping over
/// each other's singleton locks.
pub fn chrome_args(instance_id: usize) -> Vec<String> {
    let unique_id = format!("{}-{}", std::process::id(), instance_id);

    vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--hide-scrollbars".to_string(),
        "--lang=en-US".to_string(),
        format!(
            "--window-size={},{}",
            crate::capture::VIEWPORT_WIDTH,
            crate::capture::VIEWPORT_HEIGHT
        ),
        format!("--user-data-dir=/tmp/gmaps-screenshot-{unique_id}"),
        format!("--remote-debugging-port={}", 9222 + instance_id),
    ]
}

pub fn browser_config(
    config: &Config,
    instance_id: usize,
) -> Result<chromiumoxide::browser::BrowserConfig, PipelineError> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder()
        .window_size(
            crate::capture::VIEWPORT_WIDTH,
            crate::capture::VIEWPORT_HEIGHT,
        )
        .args(chrome_args(instance_id));

    if let Some(chrome_path) = &config.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build().map_err(PipelineError::BrowserLaunchFailed)
}
