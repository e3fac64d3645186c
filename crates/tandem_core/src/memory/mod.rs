//! # Memory Management
//!
//! Frame-scoped arenas and cross-thread object tracking.
//!
//! ## Design Philosophy
//!
//! Arenas are allocated once at startup. During a frame:
//! - Transient payloads are bump-allocated, never freed individually
//! - Whole arenas are recycled by `update()`
//! - Shared objects are registered so leaks surface at shutdown

mod frame_alloc;
mod registry;

pub use frame_alloc::{FrameAllocator, FrameBlock, DEFAULT_ALIGN};
pub use registry::{CoreObjectHandle, CoreObjectId, ObjectRegistry};
