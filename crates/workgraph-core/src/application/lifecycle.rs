use std::sync::{RwLock, RwLockReadGuard};

/// Scoped permit controlling whether caller-visible callbacks may be
/// delivered.
///
/// Deliveries acquire a permit (the read side of a lock); disposing the
/// owner revokes the guard on the write side, which waits for in-flight
/// deliveries to drain. After [`LifecycleGuard::revoke`] returns, no
/// further permit can be acquired, so no queued or late completion can
/// reach caller state.
#[derive(Debug)]
pub struct LifecycleGuard {
    active: RwLock<bool>,
}

/// Proof that delivery is currently permitted; holds the guard open until
/// dropped
#[derive(Debug)]
pub struct DeliveryPermit<'a> {
    _lock: RwLockReadGuard<'a, bool>,
}

impl LifecycleGuard {
    /// Create an active guard
    pub fn new() -> Self {
        Self {
            active: RwLock::new(true),
        }
    }

    /// Acquire a delivery permit, or `None` once the guard is revoked
    pub fn acquire(&self) -> Option<DeliveryPermit<'_>> {
        let lock = self.active.read().unwrap_or_else(|e| e.into_inner());
        if *lock {
            Some(DeliveryPermit { _lock: lock })
        } else {
            None
        }
    }

    /// Revoke the guard. Idempotent; blocks until every outstanding permit
    /// is dropped.
    pub fn revoke(&self) {
        let mut lock = self.active.write().unwrap_or_else(|e| e.into_inner());
        *lock = false;
    }

    /// Whether permits can still be acquired
    pub fn is_active(&self) -> bool {
        *self.active.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for LifecycleGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_acquire_while_active() {
        let guard = LifecycleGuard::new();
        assert!(guard.is_active());
        assert!(guard.acquire().is_some());
    }

    #[test]
    fn test_acquire_after_revoke() {
        let guard = LifecycleGuard::new();
        guard.revoke();

        assert!(!guard.is_active());
        assert!(guard.acquire().is_none());
    }

    #[test]
    fn test_revoke_is_idempotent() {
        let guard = LifecycleGuard::new();
        guard.revoke();
        guard.revoke();
        assert!(!guard.is_active());
    }

    #[test]
    fn test_revoke_waits_for_inflight_permit() {
        let guard = Arc::new(LifecycleGuard::new());
        let (delivered_tx, delivered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        // A delivery holds its permit until released
        let delivery_guard = Arc::clone(&guard);
        let delivery = std::thread::spawn(move || {
            let permit = delivery_guard.acquire().unwrap();
            delivered_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            drop(permit);
        });

        delivered_rx.recv().unwrap();

        // Revoke from another thread; it must block on the held permit
        let revoke_guard = Arc::clone(&guard);
        let (revoked_tx, revoked_rx) = mpsc::channel();
        let revoker = std::thread::spawn(move || {
            revoke_guard.revoke();
            revoked_tx.send(()).unwrap();
        });

        assert!(
            revoked_rx.recv_timeout(Duration::from_millis(50)).is_err(),
            "revoke returned while a permit was still held"
        );

        release_tx.send(()).unwrap();
        revoked_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("revoke did not finish after the permit was dropped");

        delivery.join().unwrap();
        revoker.join().unwrap();
        assert!(guard.acquire().is_none());
    }
}
