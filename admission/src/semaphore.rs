//! Counting semaphore with queued actions.
//!
//! The permit count may go negative: `-n` means `n` actions are queued.
//! All draining happens inside [`Semaphore::release`]; there is no
//! background task and queued deadlines are only checked when a permit is
//! freed.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{AdmissionError, Result};

/// Boxed one-shot callback used for queued actions and timeout handlers.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

struct Waiter {
    action: Callback,
    deadline: Option<Instant>,
    on_timeout: Option<Callback>,
}

impl Waiter {
    fn is_expired(&self, now: Instant) -> bool {
        self.deadline.map_or(false, |deadline| now >= deadline)
    }
}

struct Inner {
    permits: i64,
    pending: VecDeque<Waiter>,
}

/// Counting semaphore admitting callbacks instead of blocking threads.
pub struct Semaphore {
    initial: i64,
    inner: Mutex<Inner>,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        let permits = permits as i64;
        Self {
            initial: permits,
            inner: Mutex::new(Inner {
                permits,
                pending: VecDeque::new(),
            }),
        }
    }

    /// Take a permit for `action`.
    ///
    /// If a permit is free the action runs synchronously before this call
    /// returns. Otherwise the action is queued in FIFO order. With a
    /// `timeout`, a queued action that is still waiting when its deadline
    /// passes is dropped at the next `release` and `on_timeout` runs instead.
    pub fn acquire<F>(&self, action: F, timeout: Option<Duration>, on_timeout: Option<Callback>)
    where
        F: FnOnce() + Send + 'static,
    {
        let run_now = {
            let mut inner = self.inner.lock();
            inner.permits -= 1;
            if inner.permits >= 0 {
                true
            } else {
                inner.pending.push_back(Waiter {
                    action: Box::new(action),
                    deadline: timeout.map(|t| Instant::now() + t),
                    on_timeout,
                });
                debug!(pending = inner.pending.len(), "semaphore waiter queued");
                return;
            }
        };

        if run_now {
            action();
        }
    }

    /// Run `action` only if a permit is free right now.
    pub fn try_acquire<F>(&self, action: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut inner = self.inner.lock();
            if inner.permits <= 0 {
                return false;
            }
            inner.permits -= 1;
        }
        action();
        true
    }

    /// Return a permit.
    ///
    /// The oldest queued waiter receives it. Expired waiters met on the way
    /// get their timeout callback and the permit moves on to the next one.
    pub fn release(&self) {
        let mut timed_out: Vec<Callback> = Vec::new();

        let granted = {
            let mut inner = self.inner.lock();
            inner.permits += 1;

            let now = Instant::now();
            let mut granted = None;
            while let Some(waiter) = inner.pending.pop_front() {
                if waiter.is_expired(now) {
                    // The expired waiter's reservation is returned with it.
                    inner.permits += 1;
                    if let Some(callback) = waiter.on_timeout {
                        timed_out.push(callback);
                    }
                    continue;
                }
                granted = Some(waiter.action);
                break;
            }

            if granted.is_none() && inner.permits > self.initial {
                warn!(
                    permits = inner.permits,
                    initial = self.initial,
                    "semaphore released more often than acquired"
                );
            }
            granted
        };

        if !timed_out.is_empty() {
            debug!(expired = timed_out.len(), "semaphore waiters timed out");
        }
        for callback in timed_out {
            callback();
        }
        if let Some(action) = granted {
            action();
        }
    }

    /// Free permits, never negative.
    pub fn available(&self) -> usize {
        self.inner.lock().permits.max(0) as usize
    }

    /// Number of queued waiters, including ones whose deadline has passed
    /// but which no release has visited yet.
    pub fn pending(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Raw permit count. Negative while waiters are queued.
    pub fn permits(&self) -> i64 {
        self.inner.lock().permits
    }

    /// Async form of [`acquire`](Self::acquire).
    ///
    /// Resolves once a permit is granted. The returned guard releases the
    /// permit when dropped.
    pub async fn acquire_owned(self: &Arc<Self>, timeout: Option<Duration>) -> Result<SemaphorePermit> {
        let (tx, rx) = oneshot::channel::<SemaphorePermit>();
        let weak: Weak<Semaphore> = Arc::downgrade(self);

        self.acquire(
            move || {
                if let Some(sem) = weak.upgrade() {
                    // A dropped receiver hands the permit straight back.
                    let _ = tx.send(SemaphorePermit { sem });
                }
            },
            timeout,
            None,
        );

        match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(Ok(permit)) => Ok(permit),
                Ok(Err(_)) => Err(AdmissionError::Closed),
                Err(_) => Err(AdmissionError::Timeout(limit)),
            },
            None => rx.await.map_err(|_| AdmissionError::Closed),
        }
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Semaphore")
            .field("initial", &self.initial)
            .field("permits", &inner.permits)
            .field("pending", &inner.pending.len())
            .finish()
    }
}

/// RAII guard returned by [`Semaphore::acquire_owned`].
pub struct SemaphorePermit {
    sem: Arc<Semaphore>,
}

impl std::fmt::Debug for SemaphorePermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemaphorePermit").finish_non_exhaustive()
    }
}

impl Drop for SemaphorePermit {
    fn drop(&mut self) {
        self.sem.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Callback) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let make = move || -> Callback {
            let c = c.clone();
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
        };
        (count, make)
    }

    #[test]
    fn test_single_permit_handoff() {
        let sem = Semaphore::new(1);
        let (ran, action) = counter();

        sem.acquire(action(), None, None);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(sem.permits(), 0);

        sem.acquire(action(), None, None);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(sem.permits(), -1);
        assert_eq!(sem.pending(), 1);

        sem.release();
        assert_eq!(ran.load(Ordering::SeqCst), 2);
        assert_eq!(sem.permits(), 0);
        assert_eq!(sem.pending(), 0);
    }

    #[test]
    fn test_waiters_run_in_fifo_order() {
        let sem = Semaphore::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        for id in 0..4 {
            let order = order.clone();
            sem.acquire(move || order.lock().push(id), None, None);
        }
        assert_eq!(*order.lock(), vec![0]);

        sem.release();
        sem.release();
        sem.release();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_try_acquire() {
        let sem = Semaphore::new(1);
        let (ran, action) = counter();

        assert!(sem.try_acquire(action()));
        assert!(!sem.try_acquire(action()));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(sem.pending(), 0);

        sem.release();
        assert!(sem.try_acquire(action()));
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_available_is_idempotent_and_clamped() {
        let sem = Semaphore::new(2);
        assert_eq!(sem.available(), 2);
        assert_eq!(sem.available(), 2);

        let (_, action) = counter();
        sem.acquire(action(), None, None);
        sem.acquire(action(), None, None);
        sem.acquire(action(), None, None);
        assert_eq!(sem.permits(), -1);
        assert_eq!(sem.available(), 0);
        assert_eq!(sem.available(), 0);
    }

    #[test]
    fn test_expired_waiter_forwards_permit() {
        let sem = Semaphore::new(1);
        let (ran, action) = counter();
        let timed_out = Arc::new(AtomicBool::new(false));

        sem.acquire(action(), None, None);

        let flag = timed_out.clone();
        sem.acquire(
            action(),
            Some(Duration::from_millis(10)),
            Some(Box::new(move || flag.store(true, Ordering::SeqCst))),
        );
        sem.acquire(action(), None, None);
        assert_eq!(sem.permits(), -2);

        std::thread::sleep(Duration::from_millis(30));
        sem.release();

        assert!(timed_out.load(Ordering::SeqCst));
        // First holder plus the waiter queued behind the expired one
        assert_eq!(ran.load(Ordering::SeqCst), 2);
        assert_eq!(sem.permits(), 0);
        assert_eq!(sem.pending(), 0);
    }

    #[test]
    fn test_expired_last_waiter_restores_permit() {
        let sem = Semaphore::new(1);
        let (ran, action) = counter();

        sem.acquire(action(), None, None);
        sem.acquire(action(), Some(Duration::from_millis(5)), None);
        std::thread::sleep(Duration::from_millis(20));

        sem.release();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(sem.available(), 1);
        assert_eq!(sem.pending(), 0);
    }

    #[test]
    fn test_over_release_is_not_fatal() {
        let sem = Semaphore::new(1);
        sem.release();
        assert_eq!(sem.available(), 2);
    }

    #[test]
    fn test_action_may_release_reentrantly() {
        let sem = Arc::new(Semaphore::new(1));
        let (ran, action) = counter();

        let inner = sem.clone();
        sem.acquire(move || inner.release(), None, None);
        assert_eq!(sem.available(), 1);

        sem.acquire(action(), None, None);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_acquire_owned_waits_for_release() {
        let sem = Arc::new(Semaphore::new(1));
        let first = sem.acquire_owned(None).await.unwrap();
        assert_eq!(sem.available(), 0);

        let waiter = {
            let sem = sem.clone();
            tokio::spawn(async move { sem.acquire_owned(Some(Duration::from_secs(5))).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sem.pending(), 1);

        drop(first);
        let second = waiter.await.unwrap().unwrap();
        assert_eq!(sem.available(), 0);

        drop(second);
        assert_eq!(sem.available(), 1);
    }

    #[tokio::test]
    async fn test_acquire_owned_timeout() {
        let sem = Arc::new(Semaphore::new(1));
        let held = sem.acquire_owned(None).await.unwrap();

        let result = sem.acquire_owned(Some(Duration::from_millis(20))).await;
        assert_eq!(result.unwrap_err(), AdmissionError::Timeout(Duration::from_millis(20)));

        drop(held);
        assert_eq!(sem.available(), 1);
        assert_eq!(sem.pending(), 0);
    }
}
