// SPDX-License-Identifier: MIT OR Apache-2.0
//! Lifecycle states and the readiness latch.

use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;

/// The service lifecycle state machine.
///
/// `New → Connecting → Subscribing → Ready → Stopping → Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Constructed, not yet started.
    New,
    /// Connecting the broker and data stores.
    Connecting,
    /// Broker connected; control and data channels being subscribed.
    Subscribing,
    /// All subscriptions confirmed; traffic flows.
    Ready,
    /// Draining in-flight work.
    Stopping,
    /// Fully shut down.
    Stopped,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Subscribing => "subscribing",
            Self::Ready => "ready",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

struct LatchInner {
    bits: u64,
    target: u64,
}

/// N boolean flags exposing a single "all set" edge.
///
/// Gates the `Subscribing → Ready` transition: one flag per required
/// subscription, and the service proceeds only once every flag is up.
pub struct MultiFlagLatch {
    inner: Mutex<LatchInner>,
    tx: watch::Sender<bool>,
}

impl MultiFlagLatch {
    /// A latch with `num_flags` flags, all initially unset.
    #[must_use]
    pub fn new(num_flags: usize) -> Self {
        let target = if num_flags >= 64 {
            u64::MAX
        } else {
            (1u64 << num_flags) - 1
        };
        let (tx, _) = watch::channel(target == 0);
        Self {
            inner: Mutex::new(LatchInner { bits: 0, target }),
            tx,
        }
    }

    /// Set one flag (0-indexed). Fires the edge when it is the last one.
    pub fn set(&self, flag: usize) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.bits |= 1u64 << flag;
        if inner.bits == inner.target {
            let _ = self.tx.send(true);
        }
    }

    /// Unset one flag and drop the edge.
    pub fn unset(&self, flag: usize) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.bits &= !(1u64 << flag);
        let _ = self.tx.send(false);
    }

    /// Drop every flag and the edge.
    pub fn unset_all(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.bits = 0;
        let _ = self.tx.send(false);
    }

    /// `true` when a specific flag is set.
    #[must_use]
    pub fn is_flag_set(&self, flag: usize) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        (inner.bits >> flag) & 1 == 1
    }

    /// `true` when every flag is set.
    #[must_use]
    pub fn is_set(&self) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.bits == inner.target
    }

    /// Wait for the "all set" edge; `false` when `timeout` elapses first.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        if *rx.borrow() || self.is_set() {
            return true;
        }
        tokio::time::timeout(timeout, async {
            while rx.changed().await.is_ok() {
                if *rx.borrow() {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn edge_fires_only_when_all_flags_set() {
        let latch = MultiFlagLatch::new(3);
        assert!(!latch.is_set());
        latch.set(0);
        latch.set(2);
        assert!(!latch.is_set());
        assert!(!latch.wait(Duration::from_millis(20)).await);
        latch.set(1);
        assert!(latch.is_set());
        assert!(latch.wait(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn unset_drops_the_edge() {
        let latch = MultiFlagLatch::new(2);
        latch.set(0);
        latch.set(1);
        assert!(latch.is_set());
        latch.unset(1);
        assert!(!latch.is_set());
        assert!(latch.is_flag_set(0));
        assert!(!latch.is_flag_set(1));
    }

    #[tokio::test]
    async fn waiters_wake_on_late_edge() {
        let latch = std::sync::Arc::new(MultiFlagLatch::new(1));
        let waiter = {
            let latch = std::sync::Arc::clone(&latch);
            tokio::spawn(async move { latch.wait(Duration::from_secs(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        latch.set(0);
        assert!(waiter.await.unwrap());
    }
}
