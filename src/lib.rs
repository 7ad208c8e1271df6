//! # GMaps Screenshot Engine
//!
//! Pipeline that captures map screenshots for a set of geocoded target
//! locations, compresses them to a fixed contract (854x480, 128-colour
//! palette, progressive JPEG at quality 70), stores them under deterministic
//! keys and records their metadata idempotently in Postgres. Each run writes
//! exactly one summary stats row keyed by a unique job id.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gmaps_screenshot_engine::{db, Config, TargetLocationRepo};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load(None).await?;
//!     let pool = db::connect(&config.database).await?;
//!     let targets = TargetLocationRepo::list_active(&pool).await?;
//!     println!("{} active targets", targets.len());
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! gmaps-screenshot-engine --config config.json run
//! gmaps-screenshot-engine --config config.json migrate
//! ```

/// Configuration loading, validation and Chrome launch settings
pub mod config;

/// Error taxonomy shared across the pipeline
pub mod error;

/// Domain types flowing through the pipeline
pub mod model;

/// Maps URL construction and artifact key derivation
pub mod gmaps;

/// Browser pool management for concurrent Chrome instances
pub mod browser_pool;

/// Capture engine driving pooled browser pages
pub mod capture;

/// Image compression to the fixed output contract
pub mod processor;

/// Artifact storage backends (local filesystem, S3)
pub mod sink;

/// Postgres access: targets, metadata records, run stats
pub mod db;

/// Run counters and the stats recorder
pub mod stats;

/// Run orchestration
pub mod pipeline;

/// Command-line interface implementation
pub mod cli;

#[cfg(test)]
mod tests;

pub use browser_pool::*;
pub use capture::*;
pub use cli::*;
pub use config::*;
pub use db::*;
pub use error::*;
pub use gmaps::*;
pub use model::*;
pub use pipeline::*;
pub use processor::*;
pub use sink::*;
pub use stats::*;
