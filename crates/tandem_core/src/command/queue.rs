//! # Command Queues
//!
//! Ordered lists of deferred invocations bound for the core thread.
//!
//! Two variants exist:
//! - [`CommandQueue`]: single-owner, mutated through `&mut self`
//! - [`SyncCommandQueue`]: shareable, every operation takes an internal lock
//!
//! Execution never happens under the append lock. Producers [`flush`] the
//! queue, which swaps the buffer for an empty one, and the returned snapshot
//! is played back afterwards. A command may therefore queue further commands
//! on the same queue without deadlocking.
//!
//! [`flush`]: CommandQueue::flush

use std::fmt;

use parking_lot::Mutex;

use crate::command::async_op::OpCompleter;
use crate::command::AsyncOp;
use crate::sync::CoreToken;

/// Identifier attached to commands whose completion somebody waits for.
///
/// Allocated from a monotonically increasing counter owned by the core thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct NotifyId(u64);

impl NotifyId {
    /// Wraps a raw counter value.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw counter value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

type Callback = Box<dyn FnOnce(&CoreToken) + Send + 'static>;

/// A deferred closure for the core thread.
///
/// Commands must not panic. A panic escaping playback takes the worker down.
pub struct Command {
    callback: Callback,
    notify: Option<NotifyId>,
}

impl Command {
    /// Creates a fire-and-forget command.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(&CoreToken) + Send + 'static,
    {
        Self {
            callback: Box::new(f),
            notify: None,
        }
    }

    /// Creates a command that reports `id` to the playback callback once it ran.
    pub fn with_notify<F>(f: F, id: NotifyId) -> Self
    where
        F: FnOnce(&CoreToken) + Send + 'static,
    {
        Self {
            callback: Box::new(f),
            notify: Some(id),
        }
    }

    /// Returns the notification id, if the command carries one.
    #[inline]
    #[must_use]
    pub fn notify_id(&self) -> Option<NotifyId> {
        self.notify
    }

    /// Runs the command and returns its notification id.
    pub fn execute(self, token: &CoreToken) -> Option<NotifyId> {
        (self.callback)(token);
        self.notify
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("notify", &self.notify)
            .finish_non_exhaustive()
    }
}

/// Wraps a value-returning closure into a command completing `op`.
///
/// Dropping the command unrun (cancelled, discarded, or unwound by a panic)
/// marks `op` dropped so its waiters wake.
pub(crate) fn return_command<T, F>(f: F, op: AsyncOp<T>) -> impl FnOnce(&CoreToken) + Send + 'static
where
    T: Send + Sync + 'static,
    F: FnOnce(&CoreToken) -> T + Send + 'static,
{
    let completer = OpCompleter::new(op);
    move |token: &CoreToken| completer.complete(f(token))
}

/// Ordered, appendable list of commands (no-sync variant).
#[derive(Default)]
pub struct CommandQueue {
    commands: Vec<Command>,
}

impl CommandQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of queued commands.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Returns whether the queue is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Appends a prepared command.
    #[inline]
    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// Appends a fire-and-forget command. O(1), never blocks.
    pub fn queue<F>(&mut self, f: F)
    where
        F: FnOnce(&CoreToken) + Send + 'static,
    {
        self.push(Command::new(f));
    }

    /// Appends a command tagged for completion notification.
    pub fn queue_notify<F>(&mut self, f: F, id: NotifyId)
    where
        F: FnOnce(&CoreToken) + Send + 'static,
    {
        self.push(Command::with_notify(f, id));
    }

    /// Appends a command whose return value completes the returned handle.
    pub fn queue_return<T, F>(&mut self, f: F) -> AsyncOp<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&CoreToken) -> T + Send + 'static,
    {
        let op = AsyncOp::pending();
        self.queue(return_command(f, op.clone()));
        op
    }

    /// Swaps the buffer for an empty one and returns the old contents.
    #[must_use = "flushed commands are lost unless played back"]
    pub fn flush(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }

    /// Discards every queued command. Returns how many were dropped.
    pub fn cancel_all(&mut self) -> usize {
        let dropped = self.commands.len();
        self.commands.clear();
        dropped
    }

    /// Executes `commands` in insertion order.
    ///
    /// `on_complete` fires right after each command that carries a
    /// notification id.
    pub fn playback<C>(commands: Vec<Command>, token: &CoreToken, mut on_complete: C)
    where
        C: FnMut(NotifyId),
    {
        for command in commands {
            if let Some(id) = command.execute(token) {
                on_complete(id);
            }
        }
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("len", &self.commands.len())
            .finish()
    }
}

/// Command queue usable from several threads (sync variant).
#[derive(Debug, Default)]
pub struct SyncCommandQueue {
    inner: Mutex<CommandQueue>,
}

impl SyncCommandQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of queued commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Returns whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Appends a fire-and-forget command.
    pub fn queue<F>(&self, f: F)
    where
        F: FnOnce(&CoreToken) + Send + 'static,
    {
        self.inner.lock().queue(f);
    }

    /// Appends a command tagged for completion notification.
    pub fn queue_notify<F>(&self, f: F, id: NotifyId)
    where
        F: FnOnce(&CoreToken) + Send + 'static,
    {
        self.inner.lock().queue_notify(f, id);
    }

    /// Appends a command whose return value completes the returned handle.
    pub fn queue_return<T, F>(&self, f: F) -> AsyncOp<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&CoreToken) -> T + Send + 'static,
    {
        self.inner.lock().queue_return(f)
    }

    /// Swaps the buffer for an empty one and returns the old contents.
    ///
    /// The lock is released before the snapshot is returned.
    #[must_use = "flushed commands are lost unless played back"]
    pub fn flush(&self) -> Vec<Command> {
        self.inner.lock().flush()
    }

    /// Discards every queued command. Returns how many were dropped.
    pub fn cancel_all(&self) -> usize {
        self.inner.lock().cancel_all()
    }
}
