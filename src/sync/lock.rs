//! Single-permit lock with bounded, first-come-first-served waiting.
//!
//! Unlike a mutex guard, the permit may be released from a different
//! thread than the one that acquired it: an open acquires on the
//! operation context and the device callback releases it.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors returned by [`ResourceLock::acquire`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    /// The permit was not granted within the timeout.
    #[error("timed out after {timeout:?} waiting to {operation}")]
    AcquisitionTimeout {
        /// The operation that wanted the permit.
        operation: String,
        /// How long it waited.
        timeout: Duration,
    },
}

#[derive(Debug)]
struct Permit {
    available: bool,
    waiters: VecDeque<u64>,
    next_ticket: u64,
}

/// Mutual exclusion over the open/close transition.
#[derive(Debug)]
pub struct ResourceLock {
    permit: Mutex<Permit>,
    changed: Condvar,
}

impl ResourceLock {
    /// Creates a lock whose permit is available.
    pub fn new() -> Self {
        Self {
            permit: Mutex::new(Permit {
                available: true,
                waiters: VecDeque::new(),
                next_ticket: 0,
            }),
            changed: Condvar::new(),
        }
    }

    fn permit(&self) -> MutexGuard<'_, Permit> {
        self.permit.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Blocks until the permit is taken or `timeout` elapses.
    ///
    /// Waiters are served in arrival order.
    pub fn acquire(&self, operation: &str, timeout: Duration) -> Result<(), LockError> {
        tracing::debug!(operation, "trying to acquire lock");
        // A timeout too large for an `Instant` waits without a deadline.
        let deadline = Instant::now().checked_add(timeout);

        let mut permit = self.permit();
        let ticket = permit.next_ticket;
        permit.next_ticket = permit.next_ticket.wrapping_add(1);
        permit.waiters.push_back(ticket);

        loop {
            if permit.available && permit.waiters.front() == Some(&ticket) {
                permit.waiters.pop_front();
                permit.available = false;
                // The next waiter may need to re-check its position.
                self.changed.notify_all();
                tracing::debug!(operation, "lock acquired");
                return Ok(());
            }

            let Some(deadline) = deadline else {
                permit = self.changed.wait(permit).unwrap_or_else(|e| e.into_inner());
                continue;
            };

            let now = Instant::now();
            if now >= deadline {
                permit.waiters.retain(|t| *t != ticket);
                self.changed.notify_all();
                tracing::warn!(operation, ?timeout, "timed out waiting for lock");
                return Err(LockError::AcquisitionTimeout {
                    operation: operation.to_string(),
                    timeout,
                });
            }

            let (guard, _) = self
                .changed
                .wait_timeout(permit, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            permit = guard;
        }
    }

    /// Returns the permit.
    ///
    /// Releasing a lock whose permit is already available is a no-op and
    /// returns `false`.
    pub fn release(&self, operation: &str) -> bool {
        let mut permit = self.permit();
        if permit.available {
            tracing::debug!(operation, "lock already available, release ignored");
            return false;
        }
        permit.available = true;
        drop(permit);
        self.changed.notify_all();
        tracing::debug!(operation, "lock released");
        true
    }

    /// Number of available permits: 0 or 1.
    pub fn available_permits(&self) -> u32 {
        u32::from(self.permit().available)
    }

    /// Number of callers blocked in [`ResourceLock::acquire`].
    pub fn queued_waiters(&self) -> usize {
        self.permit().waiters.len()
    }

    /// Returns a guard that releases the permit when dropped, whether or
    /// not the holder managed to acquire it.
    pub fn release_on_drop<'a>(&'a self, operation: &'a str) -> ReleaseGuard<'a> {
        ReleaseGuard {
            lock: self,
            operation,
        }
    }
}

impl Default for ResourceLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases a [`ResourceLock`] on drop, including during unwinding.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ReleaseGuard<'a> {
    lock: &'a ResourceLock,
    operation: &'a str,
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(self.operation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_acquire_and_release() {
        let lock = ResourceLock::new();
        assert_eq!(lock.available_permits(), 1);
        lock.acquire("open", Duration::from_millis(10)).unwrap();
        assert_eq!(lock.available_permits(), 0);
        assert!(lock.release("open"));
        assert_eq!(lock.available_permits(), 1);
    }

    #[test]
    fn test_redundant_release_is_ignored() {
        let lock = ResourceLock::new();
        assert!(!lock.release("close"));
        assert!(!lock.release("close"));
        assert_eq!(lock.available_permits(), 1);
    }

    #[test]
    fn test_acquire_times_out() {
        let lock = ResourceLock::new();
        lock.acquire("open", Duration::from_millis(10)).unwrap();

        let started = Instant::now();
        let err = lock.acquire("close", Duration::from_millis(50)).unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(
            err,
            LockError::AcquisitionTimeout {
                operation: "close".to_string(),
                timeout: Duration::from_millis(50),
            }
        );
        assert_eq!(lock.available_permits(), 0);
        assert_eq!(lock.queued_waiters(), 0);
    }

    #[test]
    fn test_release_from_other_thread_wakes_waiter() {
        let lock = Arc::new(ResourceLock::new());
        lock.acquire("open", Duration::from_millis(10)).unwrap();

        let releaser = Arc::clone(&lock);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            releaser.release("onOpened");
        });

        lock.acquire("close", Duration::from_secs(2)).unwrap();
        handle.join().unwrap();
        assert_eq!(lock.available_permits(), 0);
    }

    #[test]
    fn test_release_guard_releases_without_acquire() {
        let lock = ResourceLock::new();
        lock.acquire("open", Duration::from_millis(10)).unwrap();
        {
            let _guard = lock.release_on_drop("close");
            assert!(lock.acquire("close", Duration::from_millis(10)).is_err());
        }
        assert_eq!(lock.available_permits(), 1);
    }

    #[test]
    fn test_unbounded_timeout_acquires_free_permit() {
        let lock = ResourceLock::new();
        lock.acquire("open", Duration::MAX).unwrap();
        assert_eq!(lock.available_permits(), 0);
    }

    #[test]
    fn test_unbounded_timeout_waits_for_release() {
        let lock = Arc::new(ResourceLock::new());
        lock.acquire("open", Duration::from_millis(10)).unwrap();

        let releaser = Arc::clone(&lock);
        let handle = thread::spawn(move || {
            while releaser.queued_waiters() == 0 {
                thread::yield_now();
            }
            releaser.release("onOpened");
        });

        lock.acquire("close", Duration::MAX).unwrap();
        handle.join().unwrap();
        assert_eq!(lock.available_permits(), 0);
        assert_eq!(lock.queued_waiters(), 0);
    }

    #[test]
    fn test_waiters_served_in_order() {
        let lock = Arc::new(ResourceLock::new());
        lock.acquire("holder", Duration::from_millis(10)).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..3 {
            let waiter = Arc::clone(&lock);
            let order = Arc::clone(&order);
            handles.push(thread::spawn(move || {
                waiter.acquire("waiter", Duration::from_secs(5)).unwrap();
                order.lock().unwrap().push(i);
                waiter.release("waiter");
            }));
            // Make sure each waiter is queued before the next one arrives.
            while lock.queued_waiters() < i + 1 {
                thread::yield_now();
            }
        }

        lock.release("holder");
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }
}
