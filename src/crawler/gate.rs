//! Connection gate
//!
//! Caps the number of simultaneous network transfers across every download worker.
//! A `ConnectionHandle` holds one slot for the lifetime of a transfer and gives it
//! back when dropped, so a transfer that errors, panics or is aborted cannot leak a
//! slot.
//!
//! The ceiling can shrink at runtime when the remote side keeps resetting
//! connections. A shrink takes a free permit out of circulation immediately, or,
//! when every permit is in use, retires the next permit that comes back.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug)]
struct GateShared {
    semaphore: Arc<Semaphore>,
    max: usize,
    ceiling: AtomicUsize,
    pending_shrink: AtomicUsize,
    outstanding: AtomicUsize,
    writes_blocked: AtomicBool,
}

/// Global limit on simultaneous transfers
#[derive(Debug, Clone)]
pub struct ConnectionGate {
    shared: Arc<GateShared>,
}

/// One transfer slot; released on drop
#[derive(Debug)]
pub struct ConnectionHandle {
    permit: Option<OwnedSemaphorePermit>,
    shared: Arc<GateShared>,
}

impl ConnectionGate {
    pub fn new(max_connections: usize) -> Self {
        let max = max_connections.max(1);
        Self {
            shared: Arc::new(GateShared {
                semaphore: Arc::new(Semaphore::new(max)),
                max,
                ceiling: AtomicUsize::new(max),
                pending_shrink: AtomicUsize::new(0),
                outstanding: AtomicUsize::new(0),
                writes_blocked: AtomicBool::new(false),
            }),
        }
    }

    /// Waits up to `timeout` for a free slot; `None` when none came free
    pub async fn acquire_timeout(&self, timeout: Duration) -> Option<ConnectionHandle> {
        let semaphore = self.shared.semaphore.clone();
        let permit = tokio::time::timeout(timeout, semaphore.acquire_owned())
            .await
            .ok()?
            .ok()?;
        Some(self.handle(permit))
    }

    /// Takes a slot only if one is free right now
    pub fn try_acquire(&self) -> Option<ConnectionHandle> {
        let permit = self.shared.semaphore.clone().try_acquire_owned().ok()?;
        Some(self.handle(permit))
    }

    fn handle(&self, permit: OwnedSemaphorePermit) -> ConnectionHandle {
        self.shared.outstanding.fetch_add(1, Ordering::SeqCst);
        ConnectionHandle {
            permit: Some(permit),
            shared: self.shared.clone(),
        }
    }

    /// Lowers the ceiling by one, never below one slot
    ///
    /// Returns false when the ceiling is already at its floor.
    pub fn shrink(&self) -> bool {
        let lowered = self
            .shared
            .ceiling
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                (c > 1).then(|| c - 1)
            });
        let Ok(previous) = lowered else {
            return false;
        };

        match self.shared.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit.forget(),
            Err(_) => {
                self.shared.pending_shrink.fetch_add(1, Ordering::SeqCst);
            }
        }
        tracing::warn!(
            from = previous,
            to = previous - 1,
            "lowering connection ceiling after repeated socket errors"
        );
        true
    }

    /// Number of handles currently held
    pub fn count(&self) -> usize {
        self.shared.outstanding.load(Ordering::SeqCst)
    }

    /// Current ceiling, after any shrinks
    pub fn ceiling(&self) -> usize {
        self.shared.ceiling.load(Ordering::SeqCst)
    }

    /// Configured maximum
    pub fn max(&self) -> usize {
        self.shared.max
    }

    /// Stops every open and future handle from saving its body
    pub fn block_writes(&self) {
        self.shared.writes_blocked.store(true, Ordering::SeqCst);
    }

    pub fn allow_writes(&self) {
        self.shared.writes_blocked.store(false, Ordering::SeqCst);
    }

    pub fn writes_blocked(&self) -> bool {
        self.shared.writes_blocked.load(Ordering::SeqCst)
    }
}

impl ConnectionHandle {
    /// True once writes have been blocked for a forced shutdown
    pub fn writes_blocked(&self) -> bool {
        self.shared.writes_blocked.load(Ordering::SeqCst)
    }

    pub fn writes_allowed(&self) -> bool {
        !self.writes_blocked()
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.shared.outstanding.fetch_sub(1, Ordering::SeqCst);
        if let Some(permit) = self.permit.take() {
            let retire = self
                .shared
                .pending_shrink
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if retire {
                permit.forget();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_count_never_exceeds_limit() {
        let gate = ConnectionGate::new(3);
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let gate = gate.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    let _handle = gate.acquire_timeout(WAIT).await.unwrap();
                    peak.fetch_max(gate.count(), Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
        assert_eq!(gate.count(), 0);
    }

    #[tokio::test]
    async fn test_handle_released_when_task_aborted() {
        let gate = ConnectionGate::new(1);
        let holder = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let _handle = gate.acquire_timeout(WAIT).await.unwrap();
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(gate.count(), 1);

        holder.abort();
        let _ = holder.await;
        assert_eq!(gate.count(), 0);
        assert!(gate.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_shrink_with_free_permits() {
        let gate = ConnectionGate::new(3);
        assert!(gate.shrink());
        assert_eq!(gate.ceiling(), 2);

        let a = gate.try_acquire();
        let b = gate.try_acquire();
        assert!(a.is_some() && b.is_some());
        assert!(gate.try_acquire().is_none());
    }

    #[tokio::test]
    async fn test_shrink_deferred_until_release() {
        let gate = ConnectionGate::new(2);
        let a = gate.try_acquire().unwrap();
        let b = gate.try_acquire().unwrap();

        assert!(gate.shrink());
        assert_eq!(gate.ceiling(), 1);

        drop(a);
        // The returned permit was retired
        assert!(gate.try_acquire().is_none());

        drop(b);
        let c = gate.try_acquire();
        assert!(c.is_some());
        assert!(gate.try_acquire().is_none());
    }

    #[tokio::test]
    async fn test_shrink_floor() {
        let gate = ConnectionGate::new(2);
        assert!(gate.shrink());
        assert!(!gate.shrink());
        assert_eq!(gate.ceiling(), 1);
        assert!(gate.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_block_writes_reaches_open_handles() {
        let gate = ConnectionGate::new(2);
        let handle = gate.acquire_timeout(WAIT).await.unwrap();
        assert!(handle.writes_allowed());

        gate.block_writes();
        assert!(!handle.writes_allowed());
        assert!(handle.writes_blocked());
        assert!(gate.writes_blocked());

        gate.allow_writes();
        assert!(handle.writes_allowed());
    }

    #[tokio::test]
    async fn test_acquire_timeout() {
        let gate = ConnectionGate::new(1);
        let held = gate.acquire_timeout(WAIT).await.unwrap();
        assert!(gate
            .acquire_timeout(Duration::from_millis(20))
            .await
            .is_none());

        drop(held);
        assert!(gate
            .acquire_timeout(Duration::from_millis(20))
            .await
            .is_some());
    }
}
