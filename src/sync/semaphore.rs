//! Classic counting semaphore.

use parking_lot::{Condvar, Mutex};

/// A counting semaphore built from a [`Mutex`] and a [`Condvar`].
///
/// [`wait`](Self::wait) blocks until the internal counter is positive and then
/// decrements it; [`signal`](Self::signal) increments it and wakes a waiter.
/// Share one across threads behind an [`Arc`](std::sync::Arc).
///
/// # Examples
///
/// ```
/// use rttp_proxy::sync::Semaphore;
///
/// let sem = Semaphore::new(1);
/// sem.wait();
/// assert_eq!(sem.available(), 0);
/// sem.signal();
/// assert_eq!(sem.available(), 1);
/// ```
#[derive(Debug)]
pub struct Semaphore {
    count: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    /// Creates a semaphore whose counter starts at `initial`.
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            available: Condvar::new(),
        }
    }

    /// Blocks the calling thread until the counter is greater than zero, then
    /// decrements it.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.available.wait(&mut count);
        }
        *count -= 1;
    }

    /// Increments the counter and wakes one blocked waiter.
    pub fn signal(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.available.notify_one();
    }

    /// Returns a snapshot of the counter. Only meaningful for diagnostics.
    pub fn available(&self) -> usize {
        *self.count.lock()
    }
}
