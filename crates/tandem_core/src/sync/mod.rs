//! # Threading
//!
//! The core thread, its accessors and the pool it runs on.
//!
//! ## Threads
//!
//! ```text
//! Sim thread (producer):   accessor().queue_command(..)
//!                          update()                       once per frame
//!                          submit_accessors(block)
//!
//! Core thread (consumer):  recv ─► drain snapshot ─► playback ─► complete waiters
//! ```
//!
//! Commands receive a [`CoreToken`]. Only the core thread ever holds one, so
//! core-only state such as the frame allocator is reachable only there.

mod accessor;
mod core_thread;
mod notify;
mod thread_pool;

pub use accessor::{Accessor, SyncedAccessor};
pub use core_thread::{CoreHandle, CoreThread, CoreToken, WorkerState};
pub use thread_pool::{PooledJob, SlotScheduler, ThreadPool};

#[cfg(test)]
pub(crate) use core_thread::test_token;
