//! # Thread Pool
//!
//! A small thread-recycling pool with a slot budget.
//!
//! ```text
//!   run(name, job) ──► acquire slot ──► idle thread? ──yes──► hand job over
//!                                           │
//!                                           no ──► spawn named thread
//!
//!   job done ──► release slot ──► signal PooledJob ──► park as idle (or exit)
//! ```
//!
//! This is not a job scheduler. It exists so long-lived workers such as the
//! core thread can be started on recycled threads, and so an idle worker can
//! lend its slot to other jobs through [`SlotScheduler`].

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::config::ThreadPoolConfig;
use crate::error::{panic_message, CoreError, CoreResult};

/// Lends execution slots back to a scheduler while a worker is idle.
pub trait SlotScheduler: Send + Sync {
    /// Gives the caller's slot back while it has nothing to do.
    fn release_slot(&self);

    /// Takes a slot again before resuming work. Never blocks; the budget may
    /// be briefly oversubscribed.
    fn reclaim_slot(&self);
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Task {
    name: String,
    job: Job,
    done: Sender<Result<(), String>>,
    /// Sender feeding the thread that runs this task. Handed back to the
    /// idle list when the thread parks.
    home: Sender<Task>,
}

/// Counting semaphore that tolerates going negative on reclaim.
struct Slots {
    available: Mutex<isize>,
    freed: Condvar,
}

impl Slots {
    fn new(count: usize) -> Self {
        Self {
            available: Mutex::new(isize::try_from(count).unwrap_or(isize::MAX)),
            freed: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut available = self.available.lock();
        while *available <= 0 {
            self.freed.wait(&mut available);
        }
        *available -= 1;
    }

    fn release(&self) {
        *self.available.lock() += 1;
        self.freed.notify_one();
    }

    fn take(&self) {
        *self.available.lock() -= 1;
    }

    fn available(&self) -> isize {
        *self.available.lock()
    }
}

struct PoolShared {
    config: ThreadPoolConfig,
    idle: Mutex<Vec<Sender<Task>>>,
    slots: Slots,
    active_jobs: AtomicUsize,
    live_threads: AtomicUsize,
    spawned: AtomicUsize,
}

impl PoolShared {
    /// Returns the thread's sender to the idle list. `false` means the thread
    /// should exit.
    fn park(&self, home: Sender<Task>) -> bool {
        let mut idle = self.idle.lock();
        if idle.len() >= self.config.max_idle_threads {
            return false;
        }
        idle.push(home);
        true
    }
}

/// Thread-recycling pool.
///
/// Cloning is cheap; clones share the same threads and slots.
#[derive(Clone)]
pub struct ThreadPool {
    shared: Arc<PoolShared>,
}

impl ThreadPool {
    /// Creates a pool. No threads are spawned until the first job.
    pub fn new(config: ThreadPoolConfig) -> CoreResult<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(PoolShared {
                slots: Slots::new(config.slots),
                config,
                idle: Mutex::new(Vec::new()),
                active_jobs: AtomicUsize::new(0),
                live_threads: AtomicUsize::new(0),
                spawned: AtomicUsize::new(0),
            }),
        })
    }

    /// Runs `job` on a pooled thread.
    ///
    /// Blocks while every slot is taken. A reused thread keeps the OS name it
    /// was spawned with; `name` is used for logging and panic reports.
    pub fn run<F>(&self, name: &str, job: F) -> CoreResult<PooledJob>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.slots.acquire();
        self.shared.active_jobs.fetch_add(1, Ordering::AcqRel);

        let (done_tx, done_rx) = bounded(1);
        let task = |home| Task {
            name: name.to_string(),
            job: Box::new(job),
            done: done_tx,
            home,
        };

        let idle = self.shared.idle.lock().pop();
        match idle {
            Some(home) => {
                tracing::debug!(job = name, "reusing pooled thread");
                // The parked thread holds the receiver, so this cannot fail.
                let _ = home.send(task(home.clone()));
            }
            None => {
                let (tx, rx) = unbounded();
                let _ = tx.send(task(tx.clone()));
                drop(tx);
                if let Err(err) = self.spawn_thread(name, rx) {
                    self.shared.active_jobs.fetch_sub(1, Ordering::AcqRel);
                    self.shared.slots.release();
                    return Err(err);
                }
            }
        }

        Ok(PooledJob {
            name: name.to_string(),
            done: done_rx,
        })
    }

    fn spawn_thread(&self, name: &str, rx: Receiver<Task>) -> CoreResult<()> {
        let pool = Arc::downgrade(&self.shared);
        let index = self.shared.spawned.fetch_add(1, Ordering::Relaxed);
        let thread_name = if name.is_empty() {
            format!("{}-{index}", self.shared.config.name_prefix)
        } else {
            name.to_string()
        };

        self.shared.live_threads.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || pooled_thread_main(&pool, &rx))
        {
            self.shared.live_threads.fetch_sub(1, Ordering::AcqRel);
            return Err(CoreError::SpawnFailed {
                name: thread_name,
                reason: e.to_string(),
            });
        }

        tracing::debug!(thread = %thread_name, "spawned pooled thread");
        Ok(())
    }

    /// Returns the number of parked threads waiting for work.
    #[must_use]
    pub fn idle_threads(&self) -> usize {
        self.shared.idle.lock().len()
    }

    /// Returns the number of threads alive (busy or idle).
    #[must_use]
    pub fn live_threads(&self) -> usize {
        self.shared.live_threads.load(Ordering::Acquire)
    }

    /// Returns the number of jobs currently running.
    #[must_use]
    pub fn active_jobs(&self) -> usize {
        self.shared.active_jobs.load(Ordering::Acquire)
    }

    /// Returns the free slot count. Negative while oversubscribed.
    #[must_use]
    pub fn available_slots(&self) -> isize {
        self.shared.slots.available()
    }

    /// Lets every idle thread exit.
    pub fn clear_idle(&self) {
        let dropped = std::mem::take(&mut *self.shared.idle.lock());
        tracing::debug!(threads = dropped.len(), "retiring idle pooled threads");
    }
}

impl SlotScheduler for ThreadPool {
    fn release_slot(&self) {
        self.shared.slots.release();
    }

    fn reclaim_slot(&self) {
        self.shared.slots.take();
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("live_threads", &self.live_threads())
            .field("idle_threads", &self.idle_threads())
            .field("active_jobs", &self.active_jobs())
            .field("available_slots", &self.available_slots())
            .finish()
    }
}

/// Body of every pooled thread.
///
/// Holds the pool weakly so parked threads exit once the last pool handle
/// drops and takes the idle senders with it.
fn pooled_thread_main(pool: &Weak<PoolShared>, rx: &Receiver<Task>) {
    while let Ok(task) = rx.recv() {
        let Task { name, job, done, home } = task;

        let result = panic::catch_unwind(AssertUnwindSafe(job)).map_err(|payload| {
            let message = panic_message(payload.as_ref());
            tracing::error!(job = %name, %message, "pooled job panicked");
            message
        });

        let Some(shared) = pool.upgrade() else {
            let _ = done.send(result);
            return;
        };
        shared.active_jobs.fetch_sub(1, Ordering::AcqRel);
        shared.slots.release();
        let _ = done.send(result);

        if !shared.park(home) {
            break;
        }
    }
    if let Some(shared) = pool.upgrade() {
        shared.live_threads.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Completion handle for a job started with [`ThreadPool::run`].
#[derive(Debug)]
pub struct PooledJob {
    name: String,
    done: Receiver<Result<(), String>>,
}

impl PooledJob {
    /// Returns the job name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns whether the job has finished. Never blocks.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        !self.done.is_empty()
    }

    /// Blocks until the job finished.
    ///
    /// # Errors
    ///
    /// [`CoreError::WorkerPanicked`] if the job panicked.
    pub fn join(self) -> CoreResult<()> {
        match self.done.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(CoreError::WorkerPanicked {
                name: self.name,
                message,
            }),
            Err(_) => Err(CoreError::WorkerPanicked {
                name: self.name,
                message: "job abandoned".to_string(),
            }),
        }
    }
}
