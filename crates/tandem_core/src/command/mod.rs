//! # Commands
//!
//! Deferred work for the core thread and the handles that carry its results.
//!
//! ## Flow
//!
//! ```text
//! producer:  queue(cmd) ─► [CommandQueue] ─► flush() ─► snapshot
//! core:                                      playback(snapshot, token, on_complete)
//! ```

mod async_op;
mod queue;

pub use async_op::AsyncOp;
pub use queue::{Command, CommandQueue, NotifyId, SyncCommandQueue};

pub(crate) use queue::return_command;
