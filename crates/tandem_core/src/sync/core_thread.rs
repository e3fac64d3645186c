//! # Core Thread
//!
//! The single dedicated consumer thread that executes commands.
//!
//! ## Architecture
//!
//! ```text
//!   ┌────────────┐   Run(cmd)    ┌──────────────────┐   snapshot   ┌──────────────┐
//!   │ Sim thread │──────────────►│ crossbeam channel│─────────────►│ Core thread  │
//!   └────────────┘               │  (unbounded MPSC)│  recv +      │  playback    │
//!   ┌────────────┐   Run(batch)  │                  │  try_iter    │  (no locks)  │
//!   │ Accessors  │──────────────►│                  │              └──────┬───────┘
//!   └────────────┘               └──────────────────┘                     │
//!         ▲                                                               │
//!         └──────────── one-shot completion (NotifyId) ───────────────────┘
//! ```
//!
//! ## Worker states
//!
//! `Starting → Idle ⇄ Draining`, then `ShuttingDown → Terminated` once the
//! shutdown message arrived and the channel is drained.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, ThreadId};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TryRecvError};
use parking_lot::{Mutex, RwLock};

use crate::command::{return_command, AsyncOp, Command, CommandQueue, SyncCommandQueue};
use crate::config::{CoreThreadConfig, ThreadPoolConfig};
use crate::error::{CoreError, CoreResult};
use crate::memory::{CoreObjectHandle, FrameAllocator, ObjectRegistry};
use crate::sync::accessor::AccessorState;
use crate::sync::notify::CompletionMap;
use crate::sync::thread_pool::{PooledJob, SlotScheduler, ThreadPool};

/// Capability proving the holder runs on the core thread.
///
/// Handed to every command by reference. It cannot be sent to or shared with
/// another thread, so anything reachable only through it is core-thread-only
/// by construction.
pub struct CoreToken {
    frames: Arc<FrameAllocator>,
    _not_send: PhantomData<*const ()>,
}

impl CoreToken {
    pub(crate) fn new(frames: Arc<FrameAllocator>) -> Self {
        Self {
            frames,
            _not_send: PhantomData,
        }
    }

    /// Returns the frame allocator.
    #[inline]
    #[must_use]
    pub fn frame_alloc(&self) -> &FrameAllocator {
        &self.frames
    }
}

impl std::fmt::Debug for CoreToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreToken")
            .field("frame", &self.frames.frame())
            .finish()
    }
}

/// Token for unit tests that play back commands without a worker.
#[cfg(test)]
pub(crate) fn test_token() -> CoreToken {
    CoreToken::new(Arc::new(FrameAllocator::new(4096, 2)))
}

/// Lifecycle state of the worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WorkerState {
    /// Spawned, handshake not finished.
    Starting = 0,
    /// Parked waiting for commands.
    Idle = 1,
    /// Playing back a snapshot.
    Draining = 2,
    /// Shutdown requested; draining what is left.
    ShuttingDown = 3,
    /// The worker loop has exited.
    Terminated = 4,
}

impl WorkerState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Starting,
            1 => Self::Idle,
            2 => Self::Draining,
            3 => Self::ShuttingDown,
            _ => Self::Terminated,
        }
    }
}

/// Message on the global channel.
pub(crate) enum CoreMessage {
    Run(Command),
    Shutdown,
}

static NEXT_SERVICE_ID: AtomicU64 = AtomicU64::new(1);

/// State shared between the worker and every handle.
pub(crate) struct CoreShared {
    /// Unique per `CoreThread`; keys the thread-local accessor map.
    pub(super) id: u64,
    pub(super) name: String,
    sender: Sender<CoreMessage>,
    /// Set once shutdown was requested. Enqueuers hold the read side across
    /// their send, so every accepted command is ahead of `Shutdown`.
    closing: RwLock<bool>,
    /// The owner was dropped on the core thread; the worker runs the leak
    /// check itself.
    orphaned: AtomicBool,
    core_thread: OnceLock<ThreadId>,
    state: AtomicU8,
    notify: CompletionMap,
    frames: Arc<FrameAllocator>,
    registry: ObjectRegistry,
    pub(super) synced: SyncCommandQueue,
    pub(super) accessors: Mutex<Vec<Weak<AccessorState>>>,
}

impl CoreShared {
    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Rejects new commands and queues the shutdown message once.
    fn request_shutdown(&self) {
        let mut closing = self.closing.write();
        if !*closing {
            *closing = true;
            // Fails only if the worker is already gone.
            let _ = self.sender.send(CoreMessage::Shutdown);
        }
    }

    /// Discards queued accessor commands and verifies the registry is empty.
    fn finish(&self) -> CoreResult<()> {
        let discarded = self.discard_accessors();
        if discarded > 0 {
            tracing::debug!(discarded, "discarded unsubmitted accessor commands");
        }
        self.registry.check_leaks().map_err(|err| {
            tracing::error!(name = %self.name, %err, "core objects leaked");
            err
        })
    }
}

/// Cheap, cloneable, thread-safe handle to a running core thread.
#[derive(Clone)]
pub struct CoreHandle {
    pub(super) shared: Arc<CoreShared>,
}

impl CoreHandle {
    /// Returns whether the caller is the live core thread.
    #[must_use]
    pub fn is_core_thread(&self) -> bool {
        self.shared.core_thread.get() == Some(&thread::current().id())
            && self.shared.state() != WorkerState::Terminated
    }

    /// Returns the worker's thread id once the startup handshake finished.
    #[must_use]
    pub fn core_thread_id(&self) -> Option<ThreadId> {
        self.shared.core_thread.get().copied()
    }

    /// Returns the worker state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    /// Returns the configured worker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Returns the number of blocked callers waiting for a completion.
    #[must_use]
    pub fn pending_waiters(&self) -> usize {
        self.shared.notify.pending()
    }

    pub(super) fn token(&self) -> CoreToken {
        CoreToken::new(Arc::clone(&self.shared.frames))
    }

    /// Puts a command on the global channel.
    fn enqueue(&self, command: Command) -> CoreResult<()> {
        let closing = self.shared.closing.read();
        if *closing {
            return Err(CoreError::ShutDown);
        }
        self.shared
            .sender
            .send(CoreMessage::Run(command))
            .map_err(|_| CoreError::ShutDown)
    }

    /// Queues `f` for the core thread.
    ///
    /// With `block` the call returns only after `f` ran. On the core thread
    /// itself `f` runs inline before the call returns.
    ///
    /// # Errors
    ///
    /// [`CoreError::ShutDown`] if the core thread is stopping or gone. A
    /// blocked caller also gets it when the worker terminates before `f` ran.
    pub fn queue_command<F>(&self, f: F, block: bool) -> CoreResult<()>
    where
        F: FnOnce(&CoreToken) + Send + 'static,
    {
        if self.is_core_thread() {
            f(&self.token());
            return Ok(());
        }
        if !block {
            return self.enqueue(Command::new(f));
        }

        let completion = self.shared.notify.register()?;
        let id = completion.id();
        if let Err(err) = self.enqueue(Command::with_notify(f, id)) {
            self.shared.notify.cancel(id);
            return Err(err);
        }
        completion.wait()
    }

    /// Queues `f` and returns a handle to its result.
    ///
    /// With `block` the handle is complete when the call returns. On the core
    /// thread `f` runs inline and the handle is always complete.
    ///
    /// # Errors
    ///
    /// Same as [`queue_command`](Self::queue_command).
    pub fn queue_return_command<T, F>(&self, f: F, block: bool) -> CoreResult<AsyncOp<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&CoreToken) -> T + Send + 'static,
    {
        if self.is_core_thread() {
            return Ok(AsyncOp::completed(f(&self.token())));
        }
        let op = AsyncOp::pending();
        self.queue_command(return_command(f, op.clone()), block)?;
        Ok(op)
    }

    /// Runs `f` with the core token if the caller is the core thread.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotCoreThread`] anywhere else.
    pub fn with_core_token<R>(&self, f: impl FnOnce(&CoreToken) -> R) -> CoreResult<R> {
        if !self.is_core_thread() {
            return Err(CoreError::NotCoreThread {
                operation: "with_core_token",
            });
        }
        Ok(f(&self.token()))
    }

    /// Submits a flushed accessor batch as a single command.
    ///
    /// An empty batch is a no-op. On the core thread the batch plays back
    /// inline.
    pub(super) fn submit_batch(&self, commands: Vec<Command>, block: bool) -> CoreResult<()> {
        if commands.is_empty() {
            return Ok(());
        }
        if self.is_core_thread() {
            self.play_inline(commands);
            return Ok(());
        }
        tracing::trace!(commands = commands.len(), block, "submitting accessor batch");
        self.queue_command(
            move |token: &CoreToken| CommandQueue::playback(commands, token, |_| {}),
            block,
        )
    }

    fn play_inline(&self, commands: Vec<Command>) {
        let notify = &self.shared.notify;
        CommandQueue::playback(commands, &self.token(), |id| notify.complete(id));
    }

    /// Per-frame hook for the simulation thread.
    ///
    /// Advances the frame allocator. Must be called once per frame before
    /// any frame-scoped allocation for that frame. Returns the new frame.
    ///
    /// # Errors
    ///
    /// [`CoreError::OnCoreThread`] when called from the core thread.
    pub fn update(&self) -> CoreResult<u64> {
        if self.is_core_thread() {
            return Err(CoreError::OnCoreThread { operation: "update" });
        }
        Ok(self.shared.frames.update())
    }

    /// Returns the current simulation frame.
    #[must_use]
    pub fn frame(&self) -> u64 {
        self.shared.frames.frame()
    }

    /// Registers an object shared with the core thread.
    pub fn register_object(&self, label: impl Into<String>) -> CoreObjectHandle {
        self.shared.registry.register_object(label)
    }

    /// Removes an object's registration.
    ///
    /// # Errors
    ///
    /// [`CoreError::UnknownObject`] for stale or repeated handles.
    pub fn unregister_object(&self, handle: CoreObjectHandle) -> CoreResult<()> {
        self.shared.registry.unregister_object(handle)
    }

    /// Returns the object registry.
    #[must_use]
    pub fn registry(&self) -> &ObjectRegistry {
        &self.shared.registry
    }
}

impl std::fmt::Debug for CoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreHandle")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .field("frame", &self.frame())
            .finish()
    }
}

/// Owner of the core thread.
///
/// Dropping it shuts the worker down; call [`shutdown`](Self::shutdown) to
/// observe the result.
pub struct CoreThread {
    handle: CoreHandle,
    worker: Option<PooledJob>,
}

impl CoreThread {
    /// Starts the worker on a thread from `pool`.
    ///
    /// Blocks until the worker reported its thread id, and while `pool` has
    /// no free slot.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidConfig`] for a bad config, [`CoreError::SpawnFailed`]
    /// or [`CoreError::WorkerPanicked`] if the worker could not start.
    pub fn start(config: CoreThreadConfig, pool: &ThreadPool) -> CoreResult<Self> {
        config.validate()?;

        let (sender, receiver) = unbounded();
        let shared = Arc::new(CoreShared {
            id: NEXT_SERVICE_ID.fetch_add(1, Ordering::Relaxed),
            name: config.thread_name.clone(),
            sender,
            closing: RwLock::new(false),
            orphaned: AtomicBool::new(false),
            core_thread: OnceLock::new(),
            state: AtomicU8::new(WorkerState::Starting as u8),
            notify: CompletionMap::new(),
            frames: Arc::new(FrameAllocator::from_config(&config)),
            registry: ObjectRegistry::new(),
            synced: SyncCommandQueue::new(),
            accessors: Mutex::new(Vec::new()),
        });

        let scheduler: Option<Box<dyn SlotScheduler>> = if config.release_slot_when_idle {
            Some(Box::new(pool.clone()))
        } else {
            None
        };

        let (ready_tx, ready_rx) = bounded(1);
        let worker_shared = Arc::clone(&shared);
        let worker = pool.run(&config.thread_name, move || {
            worker_main(&worker_shared, &receiver, scheduler.as_deref(), &ready_tx);
        })?;

        if ready_rx.recv().is_err() {
            // The worker died before the handshake.
            return Err(match worker.join() {
                Err(err) => err,
                Ok(()) => CoreError::ShutDown,
            });
        }

        Ok(Self {
            handle: CoreHandle { shared },
            worker: Some(worker),
        })
    }

    /// Starts the worker on a private thread.
    ///
    /// # Errors
    ///
    /// Same as [`start`](Self::start).
    pub fn spawn(config: CoreThreadConfig) -> CoreResult<Self> {
        let pool = ThreadPool::new(ThreadPoolConfig {
            name_prefix: config.thread_name.clone(),
            max_idle_threads: 0,
            slots: 1,
        })?;
        Self::start(config, &pool)
    }

    /// Returns the handle used to talk to the worker.
    #[must_use]
    pub fn handle(&self) -> &CoreHandle {
        &self.handle
    }

    /// Stops the worker after it drained everything already queued.
    ///
    /// Unsubmitted accessor commands are discarded. The registry must be
    /// empty afterwards. Once the worker stopped, later calls return `Ok`.
    ///
    /// # Errors
    ///
    /// - [`CoreError::OnCoreThread`] when called from a command; nothing is
    ///   stopped in that case
    /// - [`CoreError::WorkerPanicked`] if a command panicked the worker
    /// - [`CoreError::LeakedObjects`] if registrations are left; treat this
    ///   as fatal
    pub fn shutdown(&mut self) -> CoreResult<()> {
        if self.worker.is_some() && self.handle.is_core_thread() {
            return Err(CoreError::OnCoreThread {
                operation: "shutdown",
            });
        }
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let shared = &self.handle.shared;

        shared.request_shutdown();
        let joined = worker.join();
        if let Err(err) = joined {
            let _ = shared.discard_accessors();
            tracing::error!(%err, "core thread terminated abnormally");
            return Err(err);
        }
        shared.finish()?;

        tracing::info!(name = %shared.name, "core thread stopped");
        Ok(())
    }
}

impl Drop for CoreThread {
    fn drop(&mut self) {
        if self.worker.is_some() && self.handle.is_core_thread() {
            // Nobody can join the worker from here. It stops after the
            // running snapshot.
            tracing::warn!(name = %self.handle.shared.name, "core thread dropped by its own command");
            self.handle.shared.orphaned.store(true, Ordering::Release);
            self.handle.shared.request_shutdown();
            self.worker = None;
            return;
        }
        if let Err(err) = self.shutdown() {
            tracing::error!(%err, "core thread dropped with error");
        }
    }
}

impl std::fmt::Debug for CoreThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreThread")
            .field("handle", &self.handle)
            .field("running", &self.worker.is_some())
            .finish()
    }
}

/// Marks the worker terminated and releases blocked callers, also when a
/// command panics.
struct TerminationGuard<'a> {
    shared: &'a CoreShared,
}

impl Drop for TerminationGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            tracing::error!(name = %self.shared.name, "command panicked on the core thread");
        }
        self.shared.set_state(WorkerState::Terminated);
        let abandoned = self.shared.notify.close();
        if abandoned > 0 {
            tracing::warn!(abandoned, "released blocked callers at termination");
        }
    }
}

fn worker_main(
    shared: &CoreShared,
    receiver: &Receiver<CoreMessage>,
    scheduler: Option<&dyn SlotScheduler>,
    ready: &Sender<ThreadId>,
) {
    let _guard = TerminationGuard { shared };
    let id = thread::current().id();
    let _ = shared.core_thread.set(id);
    shared.set_state(WorkerState::Idle);
    tracing::info!(name = %shared.name, "core thread started");
    let _ = ready.send(id);

    let token = CoreToken::new(Arc::clone(&shared.frames));
    let play = |commands: Vec<Command>| {
        tracing::trace!(commands = commands.len(), "playing back snapshot");
        CommandQueue::playback(commands, &token, |id| shared.notify.complete(id));
    };

    loop {
        let first = match receiver.try_recv() {
            Ok(message) => message,
            Err(TryRecvError::Empty) => {
                if let Some(scheduler) = scheduler {
                    scheduler.release_slot();
                }
                let message = receiver.recv();
                if let Some(scheduler) = scheduler {
                    scheduler.reclaim_slot();
                }
                match message {
                    Ok(message) => message,
                    Err(_) => break,
                }
            }
            Err(TryRecvError::Disconnected) => break,
        };

        // Snapshot what is queued right now; later arrivals wait a round.
        let queued = receiver.len();
        let mut snapshot = Vec::with_capacity(queued + 1);
        let mut shutdown = false;
        for message in std::iter::once(first).chain(receiver.try_iter().take(queued)) {
            match message {
                CoreMessage::Run(command) => snapshot.push(command),
                CoreMessage::Shutdown => shutdown = true,
            }
        }

        if shutdown {
            shared.set_state(WorkerState::ShuttingDown);
            play(snapshot);
            loop {
                let rest: Vec<Command> = receiver
                    .try_iter()
                    .filter_map(|message| match message {
                        CoreMessage::Run(command) => Some(command),
                        CoreMessage::Shutdown => None,
                    })
                    .collect();
                if rest.is_empty() {
                    break;
                }
                play(rest);
            }
            break;
        }

        shared.set_state(WorkerState::Draining);
        play(snapshot);
        shared.set_state(WorkerState::Idle);
    }

    if shared.orphaned.load(Ordering::Acquire) {
        // Reported through the log only; the owner is gone.
        let _ = shared.finish();
    }
    tracing::info!(name = %shared.name, "core thread exiting");
}
