//! Fixed-size worker pool with a semaphore-driven dispatcher.
//!
//! A [`ThreadPool`] owns one dispatcher thread and `n` long-lived worker
//! threads. Work items are queued FIFO by [`ThreadPool::schedule`]; the
//! dispatcher waits until both a task and an idle worker exist, assigns the
//! queue head to the lowest-numbered idle slot, and wakes that worker through
//! its private [`Semaphore`].
//!
//! ```text
//!  schedule() ──push──▶ queue ──signal──▶ tasks_available
//!                                             │
//!                              dispatcher ◀───┘  waits workers_available
//!                                   │            scans slots, assigns item
//!                                   ▼
//!                       wakeups[i].signal() ──▶ worker i runs item
//!                                                   │ marks idle
//!                                                   ▼
//!                                  workers_available.signal(), outstanding -= 1
//! ```
//!
//! Admission into service is FIFO; completion order is not. The pool never
//! runs more than `n` items at once, and a panicking item is contained so its
//! slot goes back to idle.

use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, error, trace};

use crate::sync::Semaphore;

/// A unit of deferred work submitted to the pool.
pub type WorkItem = Box<dyn FnOnce() + Send + 'static>;

/// Errors produced while constructing a [`ThreadPool`].
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("a thread pool needs at least one worker")]
    ZeroWorkers,

    #[error("failed to spawn thread {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// Per-worker slot state, guarded by the slot table mutex.
#[derive(Default)]
struct Slot {
    busy: bool,
    item: Option<WorkItem>,
    stop: bool,
}

struct Shared {
    queue: Mutex<VecDeque<WorkItem>>,
    slots: Mutex<Vec<Slot>>,
    /// One private wake-up semaphore per slot, index-aligned with `slots`.
    wakeups: Vec<Semaphore>,
    tasks_available: Semaphore,
    workers_available: Semaphore,
    outstanding: Mutex<usize>,
    drained: Condvar,
    closing: AtomicBool,
}

impl Shared {
    fn finish_one(&self) {
        let mut outstanding = self.outstanding.lock();
        *outstanding -= 1;
        if *outstanding == 0 {
            self.drained.notify_all();
        }
    }
}

/// A fixed set of worker threads fed by a single dispatcher thread.
///
/// Dropping the pool (or calling [`shutdown`](Self::shutdown)) finishes every
/// queued item, then stops and joins all threads.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use rttp_proxy::pool::ThreadPool;
///
/// let pool = ThreadPool::new(4).unwrap();
/// let hits = Arc::new(AtomicUsize::new(0));
/// for _ in 0..10 {
///     let hits = Arc::clone(&hits);
///     pool.schedule(move || {
///         hits.fetch_add(1, Ordering::SeqCst);
///     });
/// }
/// pool.wait();
/// assert_eq!(hits.load(Ordering::SeqCst), 10);
/// ```
pub struct ThreadPool {
    shared: Arc<Shared>,
    dispatcher: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Creates a pool with exactly `size` worker slots and starts its threads.
    ///
    /// # Errors
    ///
    /// - [`PoolError::ZeroWorkers`] if `size` is zero.
    /// - [`PoolError::Spawn`] if the OS refuses to create a thread. Threads
    ///   started before the failure are stopped and joined.
    pub fn new(size: usize) -> Result<Self, PoolError> {
        if size == 0 {
            return Err(PoolError::ZeroWorkers);
        }

        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            slots: Mutex::new((0..size).map(|_| Slot::default()).collect()),
            wakeups: (0..size).map(|_| Semaphore::new(0)).collect(),
            tasks_available: Semaphore::new(0),
            workers_available: Semaphore::new(size),
            outstanding: Mutex::new(0),
            drained: Condvar::new(),
            closing: AtomicBool::new(false),
        });

        // Built incrementally so a spawn failure drops a partial pool, whose
        // `Drop` stops whatever already started.
        let mut pool = Self {
            shared,
            dispatcher: None,
            workers: Vec::with_capacity(size),
        };

        for index in 0..size {
            let shared = Arc::clone(&pool.shared);
            let handle = spawn_named(format!("proxy-worker-{index}"), move || {
                worker_loop(&shared, index);
            })?;
            pool.workers.push(handle);
        }

        let shared = Arc::clone(&pool.shared);
        pool.dispatcher = Some(spawn_named("proxy-dispatcher".to_owned(), move || {
            dispatcher_loop(&shared);
        })?);

        debug!(workers = size, "thread pool started");
        Ok(pool)
    }

    /// Queues `item` at the tail of the work queue and wakes the dispatcher.
    ///
    /// Never blocks on worker availability; the queue is unbounded.
    pub fn schedule<F>(&self, item: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self.shared.outstanding.lock() += 1;
        self.shared.queue.lock().push_back(Box::new(item));
        self.shared.tasks_available.signal();
    }

    /// Blocks until every item scheduled so far has finished executing.
    ///
    /// The pool remains usable afterwards.
    pub fn wait(&self) {
        let mut outstanding = self.shared.outstanding.lock();
        while *outstanding > 0 {
            self.shared.drained.wait(&mut outstanding);
        }
    }

    /// Returns the number of worker slots.
    pub fn size(&self) -> usize {
        self.shared.wakeups.len()
    }

    /// Returns the number of items submitted but not yet completed.
    pub fn outstanding(&self) -> usize {
        *self.shared.outstanding.lock()
    }

    /// Runs every queued item to completion, then stops and joins all threads.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.take() {
            self.shared.closing.store(true, Ordering::SeqCst);
            self.shared.tasks_available.signal();
            if dispatcher.join().is_err() {
                error!("dispatcher thread panicked");
            }
        }

        if self.workers.is_empty() {
            return;
        }

        for slot in self.shared.slots.lock().iter_mut() {
            slot.stop = true;
        }
        for wakeup in &self.shared.wakeups {
            wakeup.signal();
        }
        for (index, worker) in self.workers.drain(..).enumerate() {
            if worker.join().is_err() {
                error!(worker = index, "worker thread panicked");
            }
        }
        debug!("thread pool stopped");
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("size", &self.size())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

fn spawn_named<F>(name: String, body: F) -> Result<JoinHandle<()>, PoolError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.clone())
        .spawn(body)
        .map_err(|source| PoolError::Spawn { name, source })
}

fn dispatcher_loop(shared: &Shared) {
    loop {
        shared.tasks_available.wait();

        // Every `schedule` pushes before it signals, so an empty queue here
        // means the wake-up came from `stop`.
        if shared.queue.lock().is_empty() {
            if shared.closing.load(Ordering::SeqCst) {
                break;
            }
            continue;
        }

        shared.workers_available.wait();

        let mut slots = shared.slots.lock();
        let Some(index) = slots.iter().position(|slot| !slot.busy) else {
            error!("worker permit acquired but no idle slot found");
            drop(slots);
            shared.workers_available.signal();
            shared.tasks_available.signal();
            continue;
        };

        let Some(item) = shared.queue.lock().pop_front() else {
            shared.workers_available.signal();
            continue;
        };

        let slot = &mut slots[index];
        slot.item = Some(item);
        slot.busy = true;
        drop(slots);

        trace!(worker = index, "item assigned");
        shared.wakeups[index].signal();
    }
    trace!("dispatcher exiting");
}

fn worker_loop(shared: &Shared, index: usize) {
    loop {
        shared.wakeups[index].wait();

        let item = {
            let mut slots = shared.slots.lock();
            let slot = &mut slots[index];
            match slot.item.take() {
                Some(item) => item,
                None if slot.stop => break,
                None => continue,
            }
        };

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(item)) {
            error!(
                worker = index,
                panic = panic_message(payload.as_ref()),
                "work item panicked; worker recovered"
            );
        }

        shared.slots.lock()[index].busy = false;
        shared.workers_available.signal();
        shared.finish_one();
    }
    trace!(worker = index, "worker exiting");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}
