//! Completion map for blocking submissions.
//!
//! Each blocking caller gets a fresh [`NotifyId`] and a one-shot channel.
//! The core thread fires the channel after the tagged command ran. Lookup is
//! a hash map hit, not a scan over completed ids.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::command::NotifyId;
use crate::error::{CoreError, CoreResult};

#[derive(Default)]
struct Pending {
    signals: HashMap<NotifyId, Sender<()>>,
    closed: bool,
}

/// Outstanding completion signals, keyed by notification id.
#[derive(Default)]
pub(crate) struct CompletionMap {
    next_id: AtomicU64,
    pending: Mutex<Pending>,
}

/// Receiving half of a completion signal.
pub(crate) struct Completion {
    id: NotifyId,
    signal: Receiver<()>,
}

impl Completion {
    pub(crate) fn id(&self) -> NotifyId {
        self.id
    }

    /// Parks the caller until the command ran.
    ///
    /// Returns [`CoreError::ShutDown`] if the core thread terminated first.
    pub(crate) fn wait(self) -> CoreResult<()> {
        self.signal.recv().map_err(|_| CoreError::ShutDown)
    }
}

impl CompletionMap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Allocates the next notification id and its signal.
    pub(crate) fn register(&self) -> CoreResult<Completion> {
        let id = NotifyId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = bounded(1);

        let mut pending = self.pending.lock();
        if pending.closed {
            return Err(CoreError::ShutDown);
        }
        pending.signals.insert(id, tx);
        Ok(Completion { id, signal: rx })
    }

    /// Fires the signal for `id`.
    pub(crate) fn complete(&self, id: NotifyId) {
        let signal = self.pending.lock().signals.remove(&id);
        match signal {
            // The waiter may have given up already; nothing to do then.
            Some(tx) => {
                let _ = tx.send(());
            }
            None => tracing::warn!(id = id.get(), "completion for unknown notify id"),
        }
    }

    /// Forgets a registration whose command never made it onto the queue.
    pub(crate) fn cancel(&self, id: NotifyId) {
        self.pending.lock().signals.remove(&id);
    }

    /// Drops every outstanding signal and refuses new registrations.
    ///
    /// Waiters wake with [`CoreError::ShutDown`]. Returns how many were
    /// abandoned.
    pub(crate) fn close(&self) -> usize {
        let mut pending = self.pending.lock();
        pending.closed = true;
        let abandoned = pending.signals.len();
        pending.signals.clear();
        abandoned
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.lock().signals.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_ids_increase() {
        let map = CompletionMap::new();
        let a = map.register().unwrap();
        let b = map.register().unwrap();
        assert!(b.id() > a.id());
        assert_eq!(map.pending(), 2);
    }

    #[test]
    fn test_complete_wakes_waiter() {
        let map = std::sync::Arc::new(CompletionMap::new());
        let completion = map.register().unwrap();
        let id = completion.id();

        let waiter = thread::spawn(move || completion.wait());
        map.complete(id);

        assert_eq!(waiter.join().unwrap(), Ok(()));
        assert_eq!(map.pending(), 0);
    }

    #[test]
    fn test_close_releases_waiters() {
        let map = CompletionMap::new();
        let completion = map.register().unwrap();

        assert_eq!(map.close(), 1);
        assert_eq!(completion.wait(), Err(CoreError::ShutDown));
        assert!(matches!(map.register(), Err(CoreError::ShutDown)));
    }

    #[test]
    fn test_cancel_forgets_registration() {
        let map = CompletionMap::new();
        let completion = map.register().unwrap();
        map.cancel(completion.id());
        assert_eq!(map.pending(), 0);
        assert_eq!(completion.wait(), Err(CoreError::ShutDown));
    }
}
