//! # Core Error Types
//!
//! All errors that can occur in the core thread engine.
//!
//! Nearly every variant signals programmer error rather than bad input.
//! Callers are expected to fail fast on them.

use thiserror::Error;

/// Errors that can occur in the core thread engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A core-thread-only operation was attempted from another thread.
    #[error("`{operation}` may only be called from the core thread")]
    NotCoreThread {
        /// The operation that was attempted.
        operation: &'static str,
    },

    /// An operation that would deadlock on the core thread was attempted there.
    #[error("`{operation}` may not be called from the core thread")]
    OnCoreThread {
        /// The operation that was attempted.
        operation: &'static str,
    },

    /// The result of an async operation was read before it completed.
    #[error("async operation result requested before completion")]
    OperationPending,

    /// The command behind an async operation was dropped without running.
    #[error("command was dropped before it ran")]
    CommandDropped,

    /// The active frame arena has no room for the requested allocation.
    #[error("frame arena exhausted: requested {requested} bytes, {remaining} remaining")]
    ArenaExhausted {
        /// Bytes requested (including alignment padding).
        requested: usize,
        /// Bytes left in the active arena.
        remaining: usize,
    },

    /// A frame block was accessed after its arena was recycled.
    #[error("stale frame block: allocated in generation {allocated}, arena is at {current}")]
    StaleFrameBlock {
        /// Arena generation the block was allocated in.
        allocated: u64,
        /// Current arena generation.
        current: u64,
    },

    /// Data does not fit the frame block it is written to or read from.
    #[error("frame block holds {block} bytes, access needs {needed}")]
    FrameBlockSize {
        /// Size of the block.
        block: usize,
        /// Size of the access.
        needed: usize,
    },

    /// Objects were still registered when the core thread shut down.
    #[error("{live} core objects leaked at shutdown: {labels:?}")]
    LeakedObjects {
        /// Number of live registrations.
        live: usize,
        /// Labels of the live registrations.
        labels: Vec<String>,
    },

    /// The handle does not refer to a live registry entry.
    #[error("unknown core object: slot {slot}, generation {generation}")]
    UnknownObject {
        /// Slot index of the handle.
        slot: u32,
        /// Generation of the handle.
        generation: u32,
    },

    /// The operating system refused to spawn a thread.
    #[error("failed to spawn thread `{name}`: {reason}")]
    SpawnFailed {
        /// Thread name.
        name: String,
        /// OS error text.
        reason: String,
    },

    /// The core thread is shutting down or already terminated.
    #[error("core thread is shut down")]
    ShutDown,

    /// A worker job panicked.
    #[error("worker `{name}` panicked: {message}")]
    WorkerPanicked {
        /// Thread name.
        name: String,
        /// Panic payload, when it was a string.
        message: String,
    },

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
