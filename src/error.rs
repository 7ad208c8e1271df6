use std::time::Duration;
use thiserror::Error;

use crate::stats;

/// Error taxonomy for one pipeline run.
///
/// Fatal errors abort the run before any target is processed; everything else
/// is recovered per target and surfaced through logs and run counters.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("store connection failed: {0}")]
    Connection(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("browser launch failed: {0}")]
    BrowserLaunchFailed(String),

    #[error("browser instance unavailable")]
    BrowserUnavailable,

    #[error("capture failed: {0}")]
    Capture(String),

    #[error("capture timed out after {0:?}")]
    Timeout(Duration),

    #[error("image compression failed: {0}")]
    Compression(String),

    #[error("artifact write failed: {0}")]
    StoreWrite(String),

    #[error("metadata record failed: {0}")]
    Record(String),

    #[error("run stats write failed: {0}")]
    StatsWrite(String),
}

impl PipelineError {
    /// Fatal errors propagate out of the run; recoverable ones skip a single
    /// target and let the run continue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::Connection(_)
                | PipelineError::Config(_)
                | PipelineError::BrowserLaunchFailed(_)
        )
    }

    /// Run counter incremented when this error is recovered per target.
    pub fn counter_key(&self) -> &'static str {
        match self {
            PipelineError::Capture(_)
            | PipelineError::Timeout(_)
            | PipelineError::BrowserUnavailable => stats::CAPTURE_ERROR_COUNT,
            PipelineError::Compression(_) => stats::COMPRESSION_ERROR_COUNT,
            PipelineError::StoreWrite(_) => stats::STORE_ERROR_COUNT,
            PipelineError::Record(_) => stats::RECORD_ERROR_COUNT,
            _ => stats::OTHER_ERROR_COUNT,
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::StoreWrite(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(PipelineError::Connection("refused".into()).is_fatal());
        assert!(PipelineError::Config("bad".into()).is_fatal());
        assert!(PipelineError::BrowserLaunchFailed("no chrome".into()).is_fatal());

        assert!(!PipelineError::Capture("nav error".into()).is_fatal());
        assert!(!PipelineError::Timeout(Duration::from_secs(30)).is_fatal());
        assert!(!PipelineError::Compression("truncated png".into()).is_fatal());
        assert!(!PipelineError::StoreWrite("disk full".into()).is_fatal());
        assert!(!PipelineError::Record("deadlock".into()).is_fatal());
        assert!(!PipelineError::StatsWrite("closed".into()).is_fatal());
    }

    #[test]
    fn counter_key_per_step() {
        assert_eq!(
            PipelineError::Timeout(Duration::from_secs(1)).counter_key(),
            stats::CAPTURE_ERROR_COUNT
        );
        assert_eq!(
            PipelineError::Compression("x".into()).counter_key(),
            stats::COMPRESSION_ERROR_COUNT
        );
        assert_eq!(
            PipelineError::StoreWrite("x".into()).counter_key(),
            stats::STORE_ERROR_COUNT
        );
        assert_eq!(
            PipelineError::Record("x".into()).counter_key(),
            stats::RECORD_ERROR_COUNT
        );
    }
}
