//! Artifact sinks: durable storage for compressed screenshots.
//!
//! Two backends behind one trait, selected from configuration at
//! construction time. Rewrites to the same key are last-write-wins on both;
//! neither backend does read-modify-write.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::{PipelineError, StorageConfig};

/// Writes one compressed artifact at a caller-supplied key. No knowledge of
/// the upstream pipeline.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn store(&self, key: &str, bytes: &[u8]) -> Result<(), PipelineError>;
}

/// Filesystem sink. Keys become paths under `root`; parent directories are
/// created as needed. The write is not transactional: a crash mid-write can
/// leave a partial file.
pub struct LocalSink {
    root: PathBuf,
}

impl LocalSink {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl ArtifactSink for LocalSink {
    async fn store(&self, key: &str, bytes: &[u8]) -> Result<(), PipelineError> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        debug!("stored artifact at {}", path.display());
        Ok(())
    }
}

/// S3 sink. The body is staged fully in memory before upload; upload
/// failures are surfaced to the caller, not retried here.
pub struct S3Sink {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Sink {
    /// Credentials and region come from the standard AWS provider chain;
    /// an explicit region from config wins.
    pub async fn new(bucket: String, region: Option<String>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region));
        }
        let sdk_config = loader.load().await;

        Self {
            client: aws_sdk_s3::Client::new(&sdk_config),
            bucket,
        }
    }
}

#[async_trait]
impl ArtifactSink for S3Sink {
    async fn store(&self, key: &str, bytes: &[u8]) -> Result<(), PipelineError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("image/jpeg")
            .body(aws_sdk_s3::primitives::ByteStream::from(bytes.to_vec()))
            .send()
            .await
            .map_err(|e| PipelineError::StoreWrite(e.to_string()))?;
        debug!("uploaded artifact to s3://{}/{}", self.bucket, key);
        Ok(())
    }
}

/// Select the sink implementation from configuration.
pub async fn from_config(storage: &StorageConfig) -> Arc<dyn ArtifactSink> {
    match storage {
        StorageConfig::Local { root } => Arc::new(LocalSink::new(root.clone())),
        StorageConfig::S3 { bucket, region } => {
            Arc::new(S3Sink::new(bucket.clone(), region.clone()).await)
        }
    }
}
