use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::error::Result;

/// Runs deploy and cleanup jobs in the background, at most `size` at a time.
/// A failed job is logged and otherwise ignored.
#[derive(Clone)]
pub struct Dispatcher {
    permits: Arc<Semaphore>,
    size: usize,
}

impl Dispatcher {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// `max(3, 2 * cores + 1)`.
    pub fn default_size() -> usize {
        let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
        (2 * cores + 1).max(3)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs currently allowed to start without waiting.
    pub fn idle(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn dispatch<F>(&self, name: impl Into<String>, job: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            tracing::info!(job = %name, "started");
            match job.await {
                Ok(()) => tracing::info!(job = %name, "finished"),
                Err(e) => tracing::error!(job = %name, "failed: {e}"),
            }
        })
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(Self::default_size())
    }
}
