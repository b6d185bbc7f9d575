//! Worker Pool
//!
//! Bounds how many target groups the consumer processes at once. A pool of
//! one processes groups strictly one after another.

use crate::error::{Error, Result};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

/// Fixed-size pool of processing slots.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    size: usize,
    semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    /// Create a pool with `size` slots. Zero is treated as one.
    #[must_use]
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            semaphore: Arc::new(Semaphore::new(size)),
        }
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<WorkerPermit> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("worker pool closed".to_string()))?;
        debug!(available = self.semaphore.available_permits(), "Worker slot acquired");
        Ok(WorkerPermit { _permit: permit })
    }

    /// Total slots.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots not currently held.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Refuse further acquisitions; held permits stay valid.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

/// A held slot, released on drop.
#[derive(Debug)]
pub struct WorkerPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}
