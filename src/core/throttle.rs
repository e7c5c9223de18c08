//! Coalescing flush throttle.
//!
//! A burst of `request` calls produces a single deferred run of the flush
//! closure after `delay`. The pending flag is cleared just before the flush
//! starts, so a mutation that lands during a flush schedules the next one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, error};

pub struct FlushThrottle {
    delay: Duration,
    handle: Handle,
    pending: Arc<AtomicBool>,
    runs: Arc<AtomicU64>,
}

impl FlushThrottle {
    pub fn new(delay: Duration, handle: Handle) -> Self {
        Self {
            delay,
            handle,
            pending: Arc::new(AtomicBool::new(false)),
            runs: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Schedule `flush` unless one is already pending.
    ///
    /// Returns `true` if this call scheduled a new flush.
    pub fn request<F>(&self, flush: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.pending.swap(true, Ordering::AcqRel) {
            debug!("Flush already pending, coalescing");
            return false;
        }

        let delay = self.delay;
        let pending = Arc::clone(&self.pending);
        let runs = Arc::clone(&self.runs);
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            pending.store(false, Ordering::Release);
            runs.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = tokio::task::spawn_blocking(flush).await {
                error!(error = %e, "Deferred flush did not complete");
            }
        });
        true
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Number of deferred flushes started so far
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }
}
