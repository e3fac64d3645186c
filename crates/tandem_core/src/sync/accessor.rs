//! # Accessors
//!
//! Local command buffers that batch work before a single cross-thread
//! submission.
//!
//! ```text
//!   thread A: accessor().queue_command(..) x N ─┐
//!   thread B: accessor().queue_command(..) x M ─┼─ submit_accessors(block)
//!   any:      synced_accessor().queue_command ──┘        │
//!                                                        ▼
//!                         [batch A] [batch B] [synced batch]  ──► core thread
//! ```
//!
//! Each thread gets one accessor per core thread, created on first use and
//! dropped with the thread. The synced accessor is shared by everyone and
//! always submitted last.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use crate::command::{AsyncOp, Command, CommandQueue};
use crate::error::CoreResult;
use crate::sync::core_thread::{CoreHandle, CoreShared, CoreToken};

/// Queue behind one per-thread accessor.
pub(crate) struct AccessorState {
    queue: Mutex<CommandQueue>,
    thread: ThreadId,
}

struct LocalAccessor {
    core_id: u64,
    core: Weak<CoreShared>,
    state: Arc<AccessorState>,
}

thread_local! {
    static LOCAL_ACCESSORS: RefCell<Vec<LocalAccessor>> = const { RefCell::new(Vec::new()) };
}

impl CoreHandle {
    /// Returns the calling thread's accessor, creating it on first use.
    ///
    /// Every call on the same thread returns a handle to the same queue.
    #[must_use]
    pub fn accessor(&self) -> Accessor {
        let state = LOCAL_ACCESSORS.with(|locals| {
            let mut locals = locals.borrow_mut();
            locals.retain(|local| local.core.strong_count() > 0);

            if let Some(local) = locals.iter().find(|local| local.core_id == self.shared.id) {
                return Arc::clone(&local.state);
            }

            let state = Arc::new(AccessorState {
                queue: Mutex::new(CommandQueue::new()),
                thread: thread::current().id(),
            });
            self.shared.accessors.lock().push(Arc::downgrade(&state));
            locals.push(LocalAccessor {
                core_id: self.shared.id,
                core: Arc::downgrade(&self.shared),
                state: Arc::clone(&state),
            });
            tracing::debug!(core = %self.shared.name, "created thread accessor");
            state
        });

        Accessor {
            core: self.clone(),
            state,
            _not_send: PhantomData,
        }
    }

    /// Returns the accessor shared by all threads.
    #[must_use]
    pub fn synced_accessor(&self) -> SyncedAccessor {
        SyncedAccessor { core: self.clone() }
    }

    /// Submits every live thread accessor, then the synced accessor.
    ///
    /// With `block` the call returns once all of them ran. Accessors with
    /// nothing queued are skipped.
    ///
    /// # Errors
    ///
    /// [`CoreError::ShutDown`](crate::CoreError::ShutDown) if the core thread
    /// is stopping or gone.
    pub fn submit_accessors(&self, block: bool) -> CoreResult<()> {
        let states: Vec<Arc<AccessorState>> = {
            let mut accessors = self.shared.accessors.lock();
            accessors.retain(|state| state.strong_count() > 0);
            accessors.iter().filter_map(Weak::upgrade).collect()
        };

        let mut batches: Vec<Vec<Command>> = states
            .iter()
            .map(|state| state.queue.lock().flush())
            .filter(|batch| !batch.is_empty())
            .collect();
        let synced = self.shared.synced.flush();
        if !synced.is_empty() {
            batches.push(synced);
        }

        tracing::trace!(batches = batches.len(), block, "submitting accessors");

        // The channel is FIFO, so waiting on the last batch covers the rest.
        let last = batches.len().saturating_sub(1);
        for (index, batch) in batches.into_iter().enumerate() {
            self.submit_batch(batch, block && index == last)?;
        }
        Ok(())
    }
}

impl CoreShared {
    /// Drops everything queued on accessors. Returns how many commands went.
    pub(super) fn discard_accessors(&self) -> usize {
        let states: Vec<Arc<AccessorState>> = self
            .accessors
            .lock()
            .drain(..)
            .filter_map(|state| Weak::upgrade(&state))
            .collect();

        let local: usize = states.iter().map(|state| state.queue.lock().cancel_all()).sum();
        local + self.synced.cancel_all()
    }
}

/// Per-thread command buffer.
///
/// Bound to the thread that created it and cannot be sent elsewhere. Queued
/// commands are invisible to the core thread until submitted.
#[derive(Clone)]
pub struct Accessor {
    core: CoreHandle,
    state: Arc<AccessorState>,
    _not_send: PhantomData<*const ()>,
}

impl Accessor {
    /// Appends a command to the local queue.
    pub fn queue_command<F>(&self, f: F)
    where
        F: FnOnce(&CoreToken) + Send + 'static,
    {
        self.state.queue.lock().queue(f);
    }

    /// Appends a value-returning command to the local queue.
    ///
    /// On the core thread the command runs inline instead and the handle is
    /// complete on return.
    pub fn queue_return_command<T, F>(&self, f: F) -> AsyncOp<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&CoreToken) -> T + Send + 'static,
    {
        if self.core.is_core_thread() {
            return AsyncOp::completed(f(&self.core.token()));
        }
        self.state.queue.lock().queue_return(f)
    }

    /// Hands the local queue to the core thread as one batch.
    ///
    /// An empty queue returns immediately.
    ///
    /// # Errors
    ///
    /// [`CoreError::ShutDown`](crate::CoreError::ShutDown) if the core thread
    /// is stopping or gone.
    pub fn submit_to_core_thread(&self, block: bool) -> CoreResult<()> {
        let commands = self.state.queue.lock().flush();
        self.core.submit_batch(commands, block)
    }

    /// Discards the local queue. Returns how many commands were dropped.
    pub fn cancel_all(&self) -> usize {
        self.state.queue.lock().cancel_all()
    }

    /// Returns the number of commands waiting for submission.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.queue.lock().len()
    }

    /// Returns the thread this accessor belongs to.
    #[must_use]
    pub fn thread_id(&self) -> ThreadId {
        self.state.thread
    }
}

impl std::fmt::Debug for Accessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accessor")
            .field("thread", &self.state.thread)
            .field("pending", &self.pending())
            .finish()
    }
}

/// Command buffer usable from any thread.
#[derive(Clone, Debug)]
pub struct SyncedAccessor {
    core: CoreHandle,
}

impl SyncedAccessor {
    /// Appends a command to the shared queue.
    pub fn queue_command<F>(&self, f: F)
    where
        F: FnOnce(&CoreToken) + Send + 'static,
    {
        self.core.shared.synced.queue(f);
    }

    /// Appends a value-returning command to the shared queue.
    ///
    /// On the core thread the command runs inline.
    pub fn queue_return_command<T, F>(&self, f: F) -> AsyncOp<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&CoreToken) -> T + Send + 'static,
    {
        if self.core.is_core_thread() {
            return AsyncOp::completed(f(&self.core.token()));
        }
        self.core.shared.synced.queue_return(f)
    }

    /// Hands the shared queue to the core thread as one batch.
    ///
    /// # Errors
    ///
    /// [`CoreError::ShutDown`](crate::CoreError::ShutDown) if the core thread
    /// is stopping or gone.
    pub fn submit_to_core_thread(&self, block: bool) -> CoreResult<()> {
        let commands = self.core.shared.synced.flush();
        self.core.submit_batch(commands, block)
    }

    /// Discards the shared queue. Returns how many commands were dropped.
    pub fn cancel_all(&self) -> usize {
        self.core.shared.synced.cancel_all()
    }

    /// Returns the number of commands waiting for submission.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.core.shared.synced.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreThreadConfig;
    use crate::sync::CoreThread;

    fn spawn(name: &str) -> CoreThread {
        CoreThread::spawn(CoreThreadConfig {
            thread_name: name.to_string(),
            frame_arena_bytes: 4096,
            ..CoreThreadConfig::default()
        })
        .unwrap()
    }

    fn log() -> Arc<Mutex<String>> {
        Arc::new(Mutex::new(String::new()))
    }

    fn append(log: &Arc<Mutex<String>>, text: &'static str) -> impl FnOnce(&CoreToken) + Send + 'static {
        let log = Arc::clone(log);
        move |_| log.lock().push_str(text)
    }

    #[test]
    fn test_accessor_is_per_thread() {
        let mut core = spawn("acc-per-thread");
        let handle = core.handle().clone();

        let a = handle.accessor();
        let b = handle.accessor();
        a.queue_command(|_| {});
        assert_eq!(b.pending(), 1);
        assert_eq!(a.thread_id(), thread::current().id());

        let remote = handle.clone();
        let other_pending = thread::spawn(move || remote.accessor().pending()).join().unwrap();
        assert_eq!(other_pending, 0);

        assert_eq!(a.cancel_all(), 1);
        core.shutdown().unwrap();
    }

    #[test]
    fn test_submit_runs_in_queue_order() {
        let mut core = spawn("acc-fifo");
        let out = log();
        let accessor = core.handle().accessor();

        accessor.queue_command(append(&out, "a"));
        accessor.queue_command(append(&out, "b"));
        accessor.queue_command(append(&out, "c"));
        assert_eq!(out.lock().as_str(), "");

        accessor.submit_to_core_thread(true).unwrap();
        assert_eq!(out.lock().as_str(), "abc");
        assert_eq!(accessor.pending(), 0);
        core.shutdown().unwrap();
    }

    #[test]
    fn test_empty_submit_returns_immediately() {
        let mut core = spawn("acc-empty");
        let accessor = core.handle().accessor();
        accessor.submit_to_core_thread(true).unwrap();
        core.handle().synced_accessor().submit_to_core_thread(true).unwrap();
        core.handle().submit_accessors(true).unwrap();
        assert_eq!(core.handle().pending_waiters(), 0);
        core.shutdown().unwrap();
    }

    #[test]
    fn test_synced_runs_after_thread_accessors() {
        let mut core = spawn("acc-synced");
        let handle = core.handle().clone();
        let out = log();

        // Synced first in wall-clock order, still played back last.
        handle.synced_accessor().queue_command(append(&out, "2"));
        handle.accessor().queue_command(append(&out, "1"));

        handle.submit_accessors(true).unwrap();
        assert_eq!(out.lock().as_str(), "12");
        core.shutdown().unwrap();
    }

    #[test]
    fn test_submit_accessors_collects_other_threads() {
        let mut core = spawn("acc-collect");
        let handle = core.handle().clone();
        let out = log();

        // The worker thread keeps its accessor alive until told to exit.
        let (queued_tx, queued_rx) = crossbeam_channel::bounded(1);
        let (exit_tx, exit_rx) = crossbeam_channel::bounded::<()>(1);
        let remote = handle.clone();
        let remote_log = Arc::clone(&out);
        let worker = thread::spawn(move || {
            let accessor = remote.accessor();
            accessor.queue_command(append(&remote_log, "x"));
            queued_tx.send(()).unwrap();
            let _ = exit_rx.recv();
        });

        queued_rx.recv().unwrap();
        handle.submit_accessors(true).unwrap();
        assert_eq!(out.lock().as_str(), "x");

        exit_tx.send(()).unwrap();
        worker.join().unwrap();
        core.shutdown().unwrap();
    }

    #[test]
    fn test_thread_exit_discards_unsubmitted() {
        let mut core = spawn("acc-exit");
        let handle = core.handle().clone();
        let out = log();

        let remote = handle.clone();
        let remote_log = Arc::clone(&out);
        thread::spawn(move || remote.accessor().queue_command(append(&remote_log, "lost")))
            .join()
            .unwrap();

        handle.submit_accessors(true).unwrap();
        assert_eq!(out.lock().as_str(), "");
        core.shutdown().unwrap();
    }

    #[test]
    fn test_return_command_via_accessor() {
        let mut core = spawn("acc-return");
        let accessor = core.handle().accessor();

        let op = accessor.queue_return_command(|_| (3_u8, "three"));
        assert!(!op.is_complete());

        accessor.submit_to_core_thread(true).unwrap();
        assert_eq!(op.return_value(), Ok(&(3, "three")));
        core.shutdown().unwrap();
    }

    #[test]
    fn test_accessor_on_core_thread_runs_inline() {
        let mut core = spawn("acc-inline");
        let handle = core.handle().clone();
        let inner = handle.clone();

        let op = handle
            .queue_return_command(
                move |_| {
                    let accessor = inner.accessor();
                    let value = accessor.queue_return_command(|_| 7_i64);
                    let complete_before_submit = value.is_complete();

                    let ran = Arc::new(Mutex::new(false));
                    let flag = Arc::clone(&ran);
                    accessor.queue_command(move |_| *flag.lock() = true);
                    accessor.submit_to_core_thread(true).unwrap();

                    complete_before_submit && *ran.lock()
                },
                true,
            )
            .unwrap();

        assert_eq!(op.return_value(), Ok(&true));
        core.shutdown().unwrap();
    }

    #[test]
    fn test_shutdown_discards_pending_accessor_commands() {
        let mut core = spawn("acc-discard");
        let out = log();
        let accessor = core.handle().accessor();
        let synced = core.handle().synced_accessor();

        accessor.queue_command(append(&out, "a"));
        synced.queue_command(append(&out, "s"));

        core.shutdown().unwrap();
        assert_eq!(out.lock().as_str(), "");
        assert_eq!(accessor.pending(), 0);
        assert_eq!(synced.pending(), 0);
    }
}
