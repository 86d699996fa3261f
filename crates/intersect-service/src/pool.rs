// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bounded dispatch worker pool.
//!
//! The broker invokes channel handlers on its receive task; those handlers
//! enqueue work here and return immediately. Worker slots bound how many
//! dispatches run at once; user handlers run on the blocking pool inside a
//! slot, so they may block without starving the runtime.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, warn};

/// Default grace period for draining in-flight dispatches at shutdown.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(10);

/// Worker slots default to the CPU count, with a floor of 4.
#[must_use]
pub fn default_capacity() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
        .max(4)
}

struct PoolInner {
    slots: Semaphore,
    in_flight: AtomicUsize,
    closed: AtomicBool,
    idle: Notify,
}

/// Bounded pool of dispatch workers.
#[derive(Clone)]
pub struct DispatchPool {
    inner: Arc<PoolInner>,
    handle: tokio::runtime::Handle,
}

impl DispatchPool {
    /// A pool with `capacity` concurrent worker slots.
    ///
    /// Must be called within a tokio runtime.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                slots: Semaphore::new(capacity.max(1)),
                in_flight: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                idle: Notify::new(),
            }),
            handle: tokio::runtime::Handle::current(),
        }
    }

    /// Number of dispatches submitted but not yet finished.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Submit one dispatch. Callable from synchronous code (the broker's
    /// receive path); the work waits for a free slot inside the runtime.
    pub fn submit<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.inner.closed.load(Ordering::SeqCst) {
            debug!("pool closed, dropping dispatch");
            return;
        }
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        self.handle.spawn(async move {
            // slot permits bound concurrency; closing never revokes them
            if let Ok(_permit) = inner.slots.acquire().await {
                work.await;
            }
            if inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                inner.idle.notify_waiters();
            }
        });
    }

    /// Refuse new submissions.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    /// Wait up to `grace` for in-flight dispatches to finish.
    ///
    /// Returns `true` when the pool drained; `false` when work remained
    /// past the grace period (it keeps running detached).
    pub async fn drain(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if self.in_flight() == 0 {
                return true;
            }
            let notified = self.inner.idle.notified();
            if self.in_flight() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(remaining = self.in_flight(), "drain grace elapsed");
                return false;
            }
        }
    }
}
