//! Domain types flowing through the capture pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::PipelineError;

/// A geocoded point of interest read from `target_locations`.
///
/// Immutable for the duration of one run; only rows with `active = true`
/// are handed to the pipeline.
#[derive(Debug, Clone, Deserialize, Serialize, FromRow)]
pub struct TargetLocation {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    /// Logical grouping key; first segment of the artifact key.
    pub folder: String,
    pub address: Option<String>,
    pub link: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub gmaps_zoom: i32,
    /// Extra query parameters merged into the maps URL.
    pub gmaps_extra_params: Option<serde_json::Value>,
    pub active: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Raw lossless capture of one target. In-memory only: owned by the capture
/// that produced it, moved into compression, never persisted or retried.
#[derive(Debug)]
pub struct RenderedFrame {
    pub target_id: i64,
    /// PNG bytes of the full scrollable page content.
    pub png: Vec<u8>,
}

/// Compressed image for one target, produced once and consumed exactly once
/// by the artifact sink.
#[derive(Debug, Clone)]
pub struct CompressedArtifact {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl CompressedArtifact {
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Durable metadata row for one stored artifact. `file_path` is the natural
/// key; a second insert with the same path is a no-op, never an overwrite.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactRecord {
    pub target_location_id: i64,
    pub parent_folder: String,
    pub file_path: String,
    pub size: i64,
    pub job_id: String,
    pub captured_at: DateTime<Utc>,
}

/// One summary row per `job_id`, written once at run end.
#[derive(Debug, Clone, Serialize)]
pub struct RunStats {
    pub job_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_time_seconds: f64,
    pub item_scraped_count: i64,
    pub finish_reason: String,
    pub responses_per_minute: f64,
    pub items_per_minute: f64,
    /// Full snapshot of every counter collected during the run.
    pub stats: serde_json::Value,
}

/// Per-target progression. Failure at any step short-circuits that target
/// only; it never aborts the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Pending,
    Captured,
    Compressed,
    Stored,
    Recorded,
    Done,
    Failed,
}

impl std::fmt::Display for TargetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TargetState::Pending => "pending",
            TargetState::Captured => "captured",
            TargetState::Compressed => "compressed",
            TargetState::Stored => "stored",
            TargetState::Recorded => "recorded",
            TargetState::Done => "done",
            TargetState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Outcome of one target's trip through the pipeline.
#[derive(Debug)]
pub struct TargetReport {
    pub target_id: i64,
    pub name: String,
    /// Last state reached before failure, or `Done`.
    pub state: TargetState,
    pub error: Option<PipelineError>,
}

impl TargetReport {
    pub fn succeeded(&self) -> bool {
        self.state == TargetState::Done
    }
}

#[cfg(test)]
pub(crate) fn test_target(id: i64, name: &str) -> TargetLocation {
    TargetLocation {
        id,
        name: name.to_string(),
        description: None,
        folder: "plazas".to_string(),
        address: None,
        link: None,
        latitude: 20.68,
        longitude: -103.44,
        gmaps_zoom: 21,
        gmaps_extra_params: None,
        active: true,
        created_at: None,
        updated_at: None,
    }
}
