//! # Async Operation Handles
//!
//! A single-write, multi-read future for the result of a queued command.
//!
//! ```text
//!   Producer thread                         Core thread
//!   ───────────────                         ───────────
//!   op = queue_return_command(f) ──────►    value = f(token)
//!   op.is_complete() == false               op.complete(value)   (release)
//!   ...
//!   op.return_value() == Ok(&value)   (acquire)
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Condvar, Mutex};

use crate::error::{CoreError, CoreResult};

/// Shared state behind every clone of an [`AsyncOp`].
struct OpState<T> {
    /// Written exactly once. `OnceLock` publishes with release and reads with
    /// acquire, so a completed value is always fully visible to the reader.
    value: OnceLock<T>,
    /// Set when the producing command was dropped unrun.
    dropped: AtomicBool,
    /// Pairs with `completed` for blocking waiters.
    lock: Mutex<()>,
    completed: Condvar,
}

/// Handle to the result of a command executed on the core thread.
///
/// States are Pending, Completed and Dropped. The transition out of Pending
/// happens once and is irreversible. Clones share the same state and may be read from any thread.
///
/// # Example
///
/// ```rust,ignore
/// let op = core.queue_return_command(|_| 21 * 2, true)?;
/// assert_eq!(op.return_value(), Ok(&42));
/// ```
pub struct AsyncOp<T> {
    state: Arc<OpState<T>>,
}

impl<T> AsyncOp<T> {
    /// Creates a pending operation.
    pub(crate) fn pending() -> Self {
        Self {
            state: Arc::new(OpState {
                value: OnceLock::new(),
                dropped: AtomicBool::new(false),
                lock: Mutex::new(()),
                completed: Condvar::new(),
            }),
        }
    }

    /// Creates an operation that is already complete.
    ///
    /// Used when a return command runs inline on the core thread.
    pub(crate) fn completed(value: T) -> Self {
        let op = Self::pending();
        op.complete(value);
        op
    }

    /// Stores the result and wakes every waiter.
    ///
    /// # Panics
    ///
    /// Panics if the operation was already completed.
    pub(crate) fn complete(&self, value: T) {
        assert!(
            self.state.value.set(value).is_ok(),
            "async operation completed twice"
        );
        // Taking the lock orders this notify after any waiter's emptiness check.
        let _guard = self.state.lock.lock();
        self.state.completed.notify_all();
    }

    /// Marks the operation dropped and wakes every waiter.
    fn abandon(&self) {
        self.state.dropped.store(true, Ordering::Release);
        let _guard = self.state.lock.lock();
        self.state.completed.notify_all();
    }

    fn is_dropped(&self) -> bool {
        self.state.value.get().is_none() && self.state.dropped.load(Ordering::Acquire)
    }

    /// Returns whether the result is available. Never blocks.
    #[inline]
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state.value.get().is_some()
    }

    /// Returns the result.
    ///
    /// # Errors
    ///
    /// [`CoreError::OperationPending`] if the command has not run yet,
    /// [`CoreError::CommandDropped`] if it never will.
    pub fn return_value(&self) -> CoreResult<&T> {
        if let Some(value) = self.state.value.get() {
            return Ok(value);
        }
        if self.is_dropped() {
            return Err(CoreError::CommandDropped);
        }
        Err(CoreError::OperationPending)
    }

    /// Blocks until the result is available and returns it.
    ///
    /// There is no timeout.
    ///
    /// # Errors
    ///
    /// [`CoreError::CommandDropped`] once the command was dropped unrun.
    pub fn wait(&self) -> CoreResult<&T> {
        if let Some(value) = self.state.value.get() {
            return Ok(value);
        }
        let mut guard = self.state.lock.lock();
        loop {
            if let Some(value) = self.state.value.get() {
                return Ok(value);
            }
            if self.state.dropped.load(Ordering::Acquire) {
                return Err(CoreError::CommandDropped);
            }
            self.state.completed.wait(&mut guard);
        }
    }

    /// Blocks until the result is available and returns a copy of it.
    ///
    /// # Errors
    ///
    /// Same as [`wait`](Self::wait).
    pub fn into_value(self) -> CoreResult<T>
    where
        T: Clone,
    {
        self.wait().cloned()
    }
}

impl<T> Clone for AsyncOp<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for AsyncOp<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state.value.get() {
            Some(value) => f.debug_tuple("AsyncOp::Completed").field(value).finish(),
            None if self.is_dropped() => f.write_str("AsyncOp::Dropped"),
            None => f.write_str("AsyncOp::Pending"),
        }
    }
}

/// Write side of an [`AsyncOp`], moved into the command that produces it.
///
/// Dropping it without completing abandons the operation.
pub(crate) struct OpCompleter<T> {
    op: Option<AsyncOp<T>>,
}

impl<T> OpCompleter<T> {
    pub(crate) fn new(op: AsyncOp<T>) -> Self {
        Self { op: Some(op) }
    }

    pub(crate) fn complete(mut self, value: T) {
        if let Some(op) = self.op.take() {
            op.complete(value);
        }
    }
}

impl<T> Drop for OpCompleter<T> {
    fn drop(&mut self) {
        if let Some(op) = self.op.take() {
            op.abandon();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_pending_value_is_an_error() {
        let op: AsyncOp<u32> = AsyncOp::pending();
        assert!(!op.is_complete());
        assert_eq!(op.return_value(), Err(CoreError::OperationPending));
    }

    #[test]
    fn test_complete_once() {
        let op = AsyncOp::pending();
        op.complete(7_u64);
        assert!(op.is_complete());
        assert_eq!(op.return_value(), Ok(&7));
        // Reads are repeatable.
        assert_eq!(op.return_value(), Ok(&7));
    }

    #[test]
    #[should_panic(expected = "completed twice")]
    fn test_double_completion_panics() {
        let op = AsyncOp::pending();
        op.complete(1_u8);
        op.complete(2_u8);
    }

    #[test]
    fn test_clones_share_state() {
        let op = AsyncOp::pending();
        let reader = op.clone();
        op.complete("done".to_string());
        assert_eq!(reader.return_value().map(String::as_str), Ok("done"));
    }

    #[test]
    fn test_wait_across_threads() {
        let op = AsyncOp::pending();
        let producer = op.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.complete(99_i32);
        });

        assert_eq!(op.wait(), Ok(&99));
        handle.join().unwrap();
    }

    #[test]
    fn test_completed_constructor() {
        let op = AsyncOp::completed([1_u16, 2, 3]);
        assert!(op.is_complete());
        assert_eq!(op.into_value(), Ok([1, 2, 3]));
    }

    #[test]
    fn test_debug_output() {
        let op = AsyncOp::pending();
        assert_eq!(format!("{op:?}"), "AsyncOp::Pending");
        op.complete(5_u8);
        assert_eq!(format!("{op:?}"), "AsyncOp::Completed(5)");
    }

    #[test]
    fn test_dropped_completer_releases_waiter() {
        let op: AsyncOp<u32> = AsyncOp::pending();
        let completer = OpCompleter::new(op.clone());

        let waiter = {
            let op = op.clone();
            thread::spawn(move || op.wait().copied())
        };
        thread::sleep(Duration::from_millis(20));
        drop(completer);

        assert_eq!(waiter.join().unwrap(), Err(CoreError::CommandDropped));
        assert_eq!(op.return_value(), Err(CoreError::CommandDropped));
        assert!(!op.is_complete());
        assert_eq!(format!("{op:?}"), "AsyncOp::Dropped");
    }

    #[test]
    fn test_completer_completes_once() {
        let op = AsyncOp::pending();
        OpCompleter::new(op.clone()).complete("ok");
        assert_eq!(op.into_value(), Ok("ok"));
    }
}
