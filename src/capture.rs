//! Capture engine: drives one pooled browser page per target.
//!
//! The render resource (a page in a pooled Chrome instance) is scoped to
//! exactly one target and released on every exit path: the page is closed
//! after the capture attempt whatever its outcome, and dropping the pool
//! handle returns the browser slot.

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::{Page, ScreenshotParams};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::debug;

use crate::{BrowserPool, PipelineError, RenderedFrame, TargetLocation};

/// Fixed logical viewport set before every capture.
pub const VIEWPORT_WIDTH: u32 = 1280;
pub const VIEWPORT_HEIGHT: u32 = 720;

/// Produces one raw screenshot per target.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Capturer: Send + Sync {
    /// Render `url` and capture the entire scrollable content losslessly.
    /// A failure here is per-target; it must not end the run.
    async fn capture(&self, target: &TargetLocation, url: &str)
        -> Result<RenderedFrame, PipelineError>;

    /// Release all render resources. Called once, after the last capture and
    /// before the run stats are written.
    async fn shutdown(&self);
}

pub struct CaptureEngine {
    pool: BrowserPool,
    capture_timeout: Duration,
    render_settle: Duration,
    cancel: watch::Receiver<bool>,
}

impl CaptureEngine {
    pub fn new(
        pool: BrowserPool,
        capture_timeout: Duration,
        render_settle: Duration,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            pool,
            capture_timeout,
            render_settle,
            cancel,
        }
    }

    async fn capture_page(&self, page: &Page) -> Result<Vec<u8>, PipelineError> {
        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(VIEWPORT_WIDTH as i64)
            .height(VIEWPORT_HEIGHT as i64)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(PipelineError::Capture)?;
        page.execute(metrics)
            .await
            .map_err(|e| PipelineError::Capture(format!("set viewport: {e}")))?;

        page.wait_for_navigation()
            .await
            .map_err(|e| PipelineError::Capture(format!("navigation: {e}")))?;

        // Tiles keep streaming in after the load event fires.
        tokio::time::sleep(self.render_settle).await;

        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(true)
            .build();
        page.screenshot(params)
            .await
            .map_err(|e| PipelineError::Capture(format!("screenshot: {e}")))
    }
}

#[async_trait]
impl Capturer for CaptureEngine {
    async fn capture(
        &self,
        target: &TargetLocation,
        url: &str,
    ) -> Result<RenderedFrame, PipelineError> {
        if *self.cancel.borrow() {
            return Err(PipelineError::Capture("run cancelled".to_string()));
        }

        let handle = self.pool.get_browser().await?;
        debug!(
            "capturing target {} on browser instance {}",
            target.id, handle.instance_id
        );

        let page = {
            let browser = handle.browser.lock().await;
            browser
                .new_page(url)
                .await
                .map_err(|e| PipelineError::Capture(format!("open page: {e}")))?
        };

        let mut cancel = self.cancel.clone();
        let result = tokio::select! {
            captured = timeout(self.capture_timeout, self.capture_page(&page)) => {
                match captured {
                    Ok(inner) => inner,
                    Err(_) => Err(PipelineError::Timeout(self.capture_timeout)),
                }
            }
            _ = wait_cancelled(&mut cancel) => {
                Err(PipelineError::Capture("run cancelled".to_string()))
            }
        };

        // Close the page on every path; the pool handle drops right after.
        let _ = page.close().await;

        result.map(|png| RenderedFrame {
            target_id: target.id,
            png,
        })
    }

    async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

/// Resolves once the run is cancelled; pends forever if the cancellation
/// sender is gone (the run can no longer be cancelled).
pub(crate) async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}
