//! Bounded worker pool.
//!
//! One pool per service. Each in-flight handler holds one permit; the
//! permit is released when it is dropped, on every exit path.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use crate::error::{BrokerError, Result};

/// Concurrency ceiling for handler executions of one service.
#[derive(Debug)]
pub struct WorkerPool {
    name: String,
    size: usize,
    semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    /// Largest pool size: bounded by the semaphore and by `drain`, which
    /// takes every permit in one u32-sized acquisition.
    pub const MAX_WORKERS: usize = if Semaphore::MAX_PERMITS < u32::MAX as usize {
        Semaphore::MAX_PERMITS
    } else {
        u32::MAX as usize
    };

    /// Create a pool with `size` slots. A zero-sized pool is a configuration error.
    pub fn new(name: impl Into<String>, size: usize) -> Result<Self> {
        let name = name.into();
        if size == 0 || size > Self::MAX_WORKERS {
            return Err(BrokerError::Configuration(format!(
                "worker pool '{}' needs between 1 and {} workers, got {}",
                name,
                Self::MAX_WORKERS,
                size
            )));
        }
        Ok(Self {
            name,
            size,
            semaphore: Arc::new(Semaphore::new(size)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Slots currently held by running handlers.
    pub fn in_flight(&self) -> usize {
        if self.semaphore.is_closed() {
            return 0;
        }
        self.size.saturating_sub(self.available())
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// Wait for a free slot.
    ///
    /// Fails once the pool has been drained.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.semaphore.clone().acquire_owned().await.map_err(|_| {
            BrokerError::Configuration(format!("worker pool '{}' is closed", self.name))
        })
    }

    /// Wait for every in-flight handler to finish, then close the pool.
    ///
    /// Pending and future `acquire` calls fail afterwards. Idempotent.
    pub async fn drain(&self) {
        // `size` is at most MAX_WORKERS, checked in `new`.
        let permits = self.size as u32;
        match self.semaphore.acquire_many(permits).await {
            Ok(all) => {
                debug!(pool = %self.name, "Worker pool idle");
                self.semaphore.close();
                drop(all);
                info!(pool = %self.name, workers = self.size, "Worker pool drained");
            }
            Err(_) => debug!(pool = %self.name, "Worker pool already drained"),
        }
    }
}
