//! Registry of tasks parked until a key receives a value.
//!
//! Registration only ever happens while the tuple store lock is held, so the
//! acquisition order is always store → waiters. Notification runs after a
//! write has been committed and the store lock released.
//!
//! Each waiter holds the sending half of a `oneshot` channel. A signal sent
//! before the parked task starts awaiting is buffered in the channel, which is
//! what makes "register, unlock, then await" free of lost wakeups.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

struct Waiter {
    key: String,
    wake: oneshot::Sender<()>,
}

/// Unordered collection of live waiters.
#[derive(Default)]
pub struct WaitRegistry {
    waiters: Mutex<Vec<Waiter>>,
}

impl WaitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks a new waiter on `key` and returns the receiver to await.
    ///
    /// Waiters whose receiver has already been dropped (the task waiting on
    /// them went away) are pruned here.
    pub fn register(&self, key: &str) -> oneshot::Receiver<()> {
        let (wake, receiver) = oneshot::channel();
        let mut waiters = self.lock();
        waiters.retain(|waiter| !waiter.wake.is_closed());
        waiters.push(Waiter {
            key: key.to_string(),
            wake,
        });
        receiver
    }

    /// Wakes and removes every waiter registered on `key`.
    ///
    /// Returns the number of waiters that were still listening.
    pub fn notify_all(&self, key: &str) -> usize {
        let woken: Vec<Waiter> = {
            let mut waiters = self.lock();
            let (matching, rest): (Vec<_>, Vec<_>) =
                waiters.drain(..).partition(|waiter| waiter.key == key);
            *waiters = rest;
            matching
        };

        woken
            .into_iter()
            .filter(|waiter| !waiter.wake.is_closed())
            .map(|waiter| waiter.wake.send(()))
            .filter(Result::is_ok)
            .count()
    }

    /// Number of registered waiters, including any not yet pruned.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Waiter>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
