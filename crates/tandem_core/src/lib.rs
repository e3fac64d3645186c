//! # TANDEM Core Engine
//!
//! Dual-thread execution engine: a simulation thread queues deferred work
//! for a single dedicated core thread.
//!
//! - Fire-and-forget or blocking commands
//! - Typed results through [`AsyncOp`]
//! - Per-thread batching [`Accessor`]s plus one [`SyncedAccessor`]
//! - Frame-scoped transient memory ([`FrameAllocator`])
//! - Leak tracking for objects shared across threads ([`ObjectRegistry`])
//!
//! ## Architecture Rules
//!
//! 1. **One consumer** - every command runs on the core thread, in FIFO
//!    order per submission
//! 2. **No execution under locks** - queues are flushed into snapshots
//!    before playback
//! 3. **Core-only state behind [`CoreToken`]** - checked at compile time
//!
//! ## Example
//!
//! ```rust,ignore
//! use tandem_core::{CoreThread, CoreThreadConfig};
//!
//! let mut core = CoreThread::spawn(CoreThreadConfig::default())?;
//! let accessor = core.handle().accessor();
//! accessor.queue_command(|token| {
//!     let block = token.frame_alloc().store(&42_u32).unwrap();
//! });
//! core.handle().submit_accessors(true)?;
//! core.shutdown()?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod command;
pub mod config;
pub mod error;
pub mod memory;
pub mod sync;

pub use command::{AsyncOp, Command, CommandQueue, NotifyId, SyncCommandQueue};
pub use config::{CoreThreadConfig, ThreadPoolConfig};
pub use error::{CoreError, CoreResult};
pub use memory::{CoreObjectHandle, CoreObjectId, FrameAllocator, FrameBlock, ObjectRegistry};
pub use sync::{
    Accessor, CoreHandle, CoreThread, CoreToken, PooledJob, SlotScheduler, SyncedAccessor,
    ThreadPool, WorkerState,
};
