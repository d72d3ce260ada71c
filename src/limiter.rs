//! Per-pushkin concurrency gate (§4.6).
//!
//! `tokio::sync::Semaphore` already gives FIFO-fair waiter wakeup and
//! releases the permit on drop, which is exactly what cancellation safety
//! requires here -- so this is a thin, named wrapper rather than a
//! hand-rolled gate.

use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};

pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    max_connections: usize,
}

impl ConcurrencyLimiter {
    pub fn new(max_connections: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        }
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Number of permits currently checked out, for the inflight gauge.
    pub fn in_flight(&self) -> usize {
        self.max_connections - self.semaphore.available_permits()
    }

    /// Wait for a permit. Dropping the returned guard (including via task
    /// cancellation) releases it immediately.
    pub async fn acquire(&self) -> SemaphorePermit<'_> {
        self.semaphore
            .acquire()
            .await
            .expect("limiter semaphore is never closed")
    }
}
