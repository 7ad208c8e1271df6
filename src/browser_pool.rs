//! Bounded pool of Chrome instances backing the capture engine.
//!
//! Each pooled instance holds a live browser process, so the pool size caps
//! both memory use and capture concurrency. Handles return their instance to
//! the pool on drop, which makes release automatic on every exit path of a
//! capture: success, failure, timeout or cancellation.

use chromiumoxide::browser::Browser;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::{browser_config, Config, PipelineError};

/// A single Chrome instance and its CDP event-loop task.
pub struct BrowserInstance {
    pub id: usize,
    pub browser: Arc<Mutex<Browser>>,
    handler: tokio::task::JoinHandle<()>,
}

impl BrowserInstance {
    fn new(id: usize, browser: Browser, handler: tokio::task::JoinHandle<()>) -> Self {
        Self {
            id,
            browser: Arc::new(Mutex::new(browser)),
            handler,
        }
    }

    /// The handler task ends when the browser process dies or its stream
    /// errors out; either way the instance needs replacing.
    fn is_healthy(&self) -> bool {
        !self.handler.is_finished()
    }

    async fn shutdown(self) {
        let _ = self.browser.lock().await.close().await;
        self.handler.abort();
    }
}

/// Exclusive lease on one pooled browser. Dropping the handle returns the
/// instance to the pool and releases the concurrency permit.
pub struct BrowserHandle {
    pub browser: Arc<Mutex<Browser>>,
    pub instance_id: usize,
    pool: BrowserPool,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for BrowserHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserHandle")
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

impl Drop for BrowserHandle {
    fn drop(&mut self) {
        // The id must be back on the deque before the permit frees, or a
        // waiter could acquire the permit and find no instance available.
        // Fields drop after this body, so the permit is released last.
        self.pool.return_browser(self.instance_id);
    }
}

pub struct BrowserPool {
    instances: Arc<Mutex<Vec<BrowserInstance>>>,
    available: Arc<std::sync::Mutex<VecDeque<usize>>>,
    semaphore: Arc<Semaphore>,
    config: Config,
    is_shutting_down: Arc<std::sync::atomic::AtomicBool>,
}

impl BrowserPool {
    pub async fn new(config: Config) -> Result<Self, PipelineError> {
        let pool = Self {
            instances: Arc::new(Mutex::new(Vec::new())),
            available: Arc::new(std::sync::Mutex::new(VecDeque::new())),
            semaphore: Arc::new(Semaphore::new(config.browser_pool_size)),
            config,
            is_shutting_down: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        };

        pool.initialize_instances().await?;
        Ok(pool)
    }

    async fn initialize_instances(&self) -> Result<(), PipelineError> {
        let mut instances = self.instances.lock().await;

        for i in 0..self.config.browser_pool_size {
            // Stagger launches; Chrome races on profile locks otherwise.
            if i > 0 {
                sleep(Duration::from_millis(500)).await;
            }

            let instance = self.create_browser_instance(i).await?;
            instances.push(instance);
            self.available.lock().unwrap().push_back(i);
            info!("browser instance {i} created");
        }

        info!("browser pool initialized with {} instances", instances.len());
        Ok(())
    }

    async fn create_browser_instance(&self, id: usize) -> Result<BrowserInstance, PipelineError> {
        let instance_config = browser_config(&self.config, id)?;

        let (browser, mut handler) = Browser::launch(instance_config)
            .await
            .map_err(|e| PipelineError::BrowserLaunchFailed(e.to_string()))?;

        // The handler implements Stream and must be polled for the CDP
        // connection to make progress.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    error!("browser handler error: {e}");
                    return;
                }
            }
        });

        Ok(BrowserInstance::new(id, browser, handler_task))
    }

    /// Acquire an exclusive handle to a healthy instance, recreating dead
    /// ones on the way.
    pub async fn get_browser(&self) -> Result<BrowserHandle, PipelineError> {
        if self.is_shutting_down.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(PipelineError::BrowserUnavailable);
        }

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::BrowserUnavailable)?;

        let instance_id = {
            let mut available = self.available.lock().unwrap();
            available
                .pop_front()
                .ok_or(PipelineError::BrowserUnavailable)?
        };

        let browser = {
            let mut instances = self.instances.lock().await;
            let instance = match instances.get_mut(instance_id) {
                Some(instance) => instance,
                None => {
                    self.return_browser(instance_id);
                    return Err(PipelineError::BrowserUnavailable);
                }
            };

            if !instance.is_healthy() {
                warn!("browser instance {instance_id} is dead, relaunching");
                match self.create_browser_instance(instance_id).await {
                    Ok(new_instance) => *instance = new_instance,
                    Err(e) => {
                        // Put the slot back so a later acquire can retry.
                        self.return_browser(instance_id);
                        return Err(e);
                    }
                }
            }

            instance.browser.clone()
        };

        Ok(BrowserHandle {
            browser,
            instance_id,
            pool: self.clone(),
            _permit: permit,
        })
    }

    /// Synchronous so a dropping handle makes the slot visible immediately.
    fn return_browser(&self, instance_id: usize) {
        self.available.lock().unwrap().push_back(instance_id);
    }

    pub async fn shutdown(&self) {
        info!("shutting down browser pool");
        self.is_shutting_down
            .store(true, std::sync::atomic::Ordering::Relaxed);

        // Give in-flight handles a moment to drop back in.
        let mut retries = 0;
        while retries < 10 {
            if self.available.lock().unwrap().len() == self.config.browser_pool_size {
                break;
            }
            sleep(Duration::from_millis(100)).await;
            retries += 1;
        }

        let mut instances = self.instances.lock().await;
        for instance in instances.drain(..) {
            instance.shutdown().await;
        }

        info!("browser pool shutdown complete");
    }
}

impl Clone for BrowserPool {
    fn clone(&self) -> Self {
        Self {
            instances: self.instances.clone(),
            available: self.available.clone(),
            semaphore: self.semaphore.clone(),
            config: self.config.clone(),
            is_shutting_down: self.is_shutting_down.clone(),
        }
    }
}
