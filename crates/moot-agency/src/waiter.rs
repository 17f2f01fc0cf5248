//! Waiters blocking on commit-index advancement.
//!
//! A single watch channel carries the commit index; every advancement
//! broadcasts to all waiters at once, and each waiter re-checks its own
//! target, deadline and the shutdown flag, so spurious wakeups are
//! harmless.

use crate::types::LogIndex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;

pub(crate) struct WaiterRegistry {
    commit_tx: watch::Sender<LogIndex>,
    stopped: AtomicBool,
}

impl WaiterRegistry {
    pub fn new() -> Self {
        let (commit_tx, _) = watch::channel(LogIndex::ZERO);
        Self {
            commit_tx,
            stopped: AtomicBool::new(false),
        }
    }

    /// Publish a new commit index and wake every waiter.
    pub fn advance(&self, index: LogIndex) {
        self.commit_tx.send_modify(|current| {
            if index > *current {
                *current = index;
            }
        });
    }

    /// Wake all waiters with a failure outcome.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        // Touch the channel so parked waiters re-check the flag.
        self.commit_tx.send_modify(|_| {});
    }

    /// Block until the published commit index reaches `index`.
    ///
    /// `true` on success; `false` when the deadline passes or the registry
    /// shuts down first.
    pub async fn wait_for(&self, index: LogIndex, timeout: Duration) -> bool {
        let mut rx = self.commit_tx.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return false;
            }
            if *rx.borrow_and_update() >= index {
                return true;
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_wait_succeeds_on_advance() {
        let registry = Arc::new(WaiterRegistry::new());
        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .wait_for(LogIndex(3), Duration::from_secs(5))
                    .await
            })
        };

        registry.advance(LogIndex(2));
        registry.advance(LogIndex(3));
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_already_committed() {
        let registry = WaiterRegistry::new();
        registry.advance(LogIndex(10));
        assert!(registry.wait_for(LogIndex(4), Duration::from_millis(1)).await);
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let registry = WaiterRegistry::new();
        let start = tokio::time::Instant::now();
        let ok = registry
            .wait_for(LogIndex(1), Duration::from_millis(50))
            .await;
        assert!(!ok);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiters_with_failure() {
        let registry = Arc::new(WaiterRegistry::new());
        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .wait_for(LogIndex(1), Duration::from_secs(60))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        registry.shutdown();
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_advance_never_retreats() {
        let registry = WaiterRegistry::new();
        registry.advance(LogIndex(5));
        registry.advance(LogIndex(3));
        assert!(registry.wait_for(LogIndex(5), Duration::from_millis(1)).await);
    }
}
