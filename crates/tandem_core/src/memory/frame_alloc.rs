//! # Frame Allocator
//!
//! Multi-buffered bump arenas for transient, frame-scoped data.
//!
//! ```text
//! frame N     : allocate ──► [arena 0]     [arena 1]
//! update()    :              [arena 0]     [arena 1 cleared] ◄── allocate
//! frame N+1   : core reads ► [arena 0]
//! update()    :              [arena 0 cleared] ◄── allocate
//! ```
//!
//! A block lives until its arena becomes active again. With two arenas that
//! is one full frame after the frame it was allocated in, which is enough as
//! long as the simulation thread never runs more than one frame ahead of the
//! core thread.
//!
//! Every arena carries a generation counter that is bumped when it is
//! cleared. Blocks remember the generation they were carved from, so reading
//! a recycled block is reported instead of returning another frame's bytes.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use bytemuck::Pod;
use parking_lot::Mutex;

use crate::config::CoreThreadConfig;
use crate::error::{CoreError, CoreResult};

/// Alignment used by [`FrameAllocator::allocate`].
pub const DEFAULT_ALIGN: usize = 16;

/// Location of one allocation inside a frame arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FrameBlock {
    arena: usize,
    generation: u64,
    offset: usize,
    len: usize,
}

impl FrameBlock {
    /// Returns the size of the block in bytes.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns whether the block is zero-sized.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the index of the arena the block lives in.
    #[inline]
    #[must_use]
    pub const fn arena(&self) -> usize {
        self.arena
    }
}

struct ArenaState {
    storage: Box<[u8]>,
    offset: usize,
    generation: u64,
}

/// A single bump arena.
struct Arena {
    state: Mutex<ArenaState>,
}

impl Arena {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(ArenaState {
                storage: vec![0u8; capacity].into_boxed_slice(),
                offset: 0,
                generation: 0,
            }),
        }
    }
}

/// Double-buffered (or deeper) bump allocator for frame-scoped payloads.
///
/// # Thread Safety
///
/// Each arena has its own lock, which is uncontended under the frame
/// protocol. The active index is an atomic written only by [`update`]; its
/// correctness relies on the one-frame-depth protocol, not on mutual
/// exclusion.
///
/// [`update`]: FrameAllocator::update
pub struct FrameAllocator {
    arenas: Box<[Arena]>,
    capacity: usize,
    active: AtomicUsize,
    frame: AtomicU64,
}

impl FrameAllocator {
    /// Creates `buffer_count` arenas of `capacity` bytes each.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or `buffer_count` is below two.
    #[must_use]
    pub fn new(capacity: usize, buffer_count: usize) -> Self {
        assert!(capacity > 0, "Frame arena capacity must be greater than zero");
        assert!(buffer_count >= 2, "At least two frame arenas are required");

        let arenas: Vec<Arena> = (0..buffer_count).map(|_| Arena::new(capacity)).collect();
        Self {
            arenas: arenas.into_boxed_slice(),
            capacity,
            active: AtomicUsize::new(0),
            frame: AtomicU64::new(0),
        }
    }

    /// Creates the allocator described by a validated core thread config.
    #[must_use]
    pub fn from_config(config: &CoreThreadConfig) -> Self {
        Self::new(config.frame_arena_bytes, config.frame_buffer_count)
    }

    /// Returns the capacity of each arena in bytes.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of arenas.
    #[inline]
    #[must_use]
    pub fn buffer_count(&self) -> usize {
        self.arenas.len()
    }

    /// Returns the index of the arena serving allocations.
    #[inline]
    #[must_use]
    pub fn active_index(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Returns how many times [`update`](Self::update) has run.
    #[inline]
    #[must_use]
    pub fn frame(&self) -> u64 {
        self.frame.load(Ordering::Relaxed)
    }

    /// Returns the bytes used in the active arena.
    #[must_use]
    pub fn used(&self) -> usize {
        self.arenas[self.active_index()].state.lock().offset
    }

    /// Returns the bytes left in the active arena.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity - self.used()
    }

    /// Allocates `size` zeroed bytes from the active arena.
    pub fn allocate(&self, size: usize) -> CoreResult<FrameBlock> {
        self.allocate_aligned(size, DEFAULT_ALIGN)
    }

    /// Allocates `size` zeroed bytes, aligned relative to the arena base.
    ///
    /// # Errors
    ///
    /// [`CoreError::ArenaExhausted`] when the active arena is full. Arenas are
    /// expected to be sized so this never happens.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    pub fn allocate_aligned(&self, size: usize, align: usize) -> CoreResult<FrameBlock> {
        assert!(align.is_power_of_two(), "Alignment must be a power of two");

        let arena = self.active_index();
        let mut state = self.arenas[arena].state.lock();

        let aligned_offset = (state.offset + align - 1) & !(align - 1);
        let new_offset = aligned_offset
            .checked_add(size)
            .filter(|end| *end <= self.capacity)
            .ok_or_else(|| {
                tracing::error!(arena, size, "frame arena exhausted");
                CoreError::ArenaExhausted {
                    requested: size.saturating_add(aligned_offset - state.offset),
                    remaining: self.capacity - state.offset,
                }
            })?;

        state.storage[aligned_offset..new_offset].fill(0);
        state.offset = new_offset;

        Ok(FrameBlock {
            arena,
            generation: state.generation,
            offset: aligned_offset,
            len: size,
        })
    }

    /// Copies a plain-old-data value into the active arena.
    pub fn store<T: Pod>(&self, value: &T) -> CoreResult<FrameBlock> {
        let block = self.allocate_aligned(std::mem::size_of::<T>(), std::mem::align_of::<T>())?;
        self.write(&block, bytemuck::bytes_of(value))?;
        Ok(block)
    }

    /// Copies a slice of plain-old-data values into the active arena.
    pub fn store_slice<T: Pod>(&self, values: &[T]) -> CoreResult<FrameBlock> {
        let bytes: &[u8] = bytemuck::cast_slice(values);
        let block = self.allocate_aligned(bytes.len(), std::mem::align_of::<T>())?;
        self.write(&block, bytes)?;
        Ok(block)
    }

    /// Writes `data` to the start of `block`.
    pub fn write(&self, block: &FrameBlock, data: &[u8]) -> CoreResult<()> {
        if data.len() > block.len {
            return Err(CoreError::FrameBlockSize {
                block: block.len,
                needed: data.len(),
            });
        }
        let mut state = self.arenas[block.arena].state.lock();
        Self::check_generation(&state, block)?;
        state.storage[block.offset..block.offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Runs `f` over the bytes of `block`.
    ///
    /// The arena lock is held while `f` runs.
    pub fn with_bytes<R>(&self, block: &FrameBlock, f: impl FnOnce(&[u8]) -> R) -> CoreResult<R> {
        let state = self.arenas[block.arena].state.lock();
        Self::check_generation(&state, block)?;
        Ok(f(&state.storage[block.offset..block.offset + block.len]))
    }

    /// Reads back a value written with [`store`](Self::store).
    pub fn load<T: Pod>(&self, block: &FrameBlock) -> CoreResult<T> {
        let size = std::mem::size_of::<T>();
        if block.len != size {
            return Err(CoreError::FrameBlockSize {
                block: block.len,
                needed: size,
            });
        }
        self.with_bytes(block, bytemuck::pod_read_unaligned::<T>)
    }

    /// Reads back values written with [`store_slice`](Self::store_slice).
    pub fn load_slice<T: Pod>(&self, block: &FrameBlock) -> CoreResult<Vec<T>> {
        let size = std::mem::size_of::<T>();
        if size == 0 {
            return Ok(Vec::new());
        }
        if block.len % size != 0 {
            return Err(CoreError::FrameBlockSize {
                block: block.len,
                needed: block.len.next_multiple_of(size),
            });
        }
        self.with_bytes(block, |bytes| {
            bytes
                .chunks_exact(size)
                .map(bytemuck::pod_read_unaligned::<T>)
                .collect()
        })
    }

    /// Advances to the next arena and clears it.
    ///
    /// Called once per simulation frame, before any allocation for that
    /// frame. Returns the new frame number.
    pub fn update(&self) -> u64 {
        let next = (self.active.load(Ordering::Acquire) + 1) % self.arenas.len();
        {
            let mut state = self.arenas[next].state.lock();
            state.offset = 0;
            state.generation += 1;
        }
        self.active.store(next, Ordering::Release);
        let frame = self.frame.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(frame, arena = next, "frame allocator advanced");
        frame
    }

    fn check_generation(state: &ArenaState, block: &FrameBlock) -> CoreResult<()> {
        if state.generation == block.generation {
            Ok(())
        } else {
            Err(CoreError::StaleFrameBlock {
                allocated: block.generation,
                current: state.generation,
            })
        }
    }
}

impl std::fmt::Debug for FrameAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameAllocator")
            .field("buffer_count", &self.arenas.len())
            .field("capacity", &self.capacity)
            .field("active", &self.active_index())
            .field("frame", &self.frame())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
    #[repr(C)]
    struct Sentinel {
        magic: u32,
        frame: u32,
    }

    #[test]
    fn test_allocation_uses_active_arena() {
        let alloc = FrameAllocator::new(1024, 2);
        let block = alloc.allocate(10).unwrap();
        assert_eq!(block.len(), 10);
        assert_eq!(block.arena(), 0);
        assert_eq!(alloc.used(), 10);
    }

    #[test]
    fn test_alignment() {
        let alloc = FrameAllocator::new(1024, 2);
        let _ = alloc.allocate_aligned(3, 1).unwrap();
        let block = alloc.allocate_aligned(8, 8).unwrap();
        assert_eq!(block.offset, 8);
        assert_eq!(alloc.used(), 16);
    }

    #[test]
    fn test_exhaustion() {
        let alloc = FrameAllocator::new(32, 2);
        let _ = alloc.allocate(24).unwrap();
        let err = alloc.allocate(16).unwrap_err();
        assert!(matches!(err, CoreError::ArenaExhausted { remaining: 8, .. }));
    }

    #[test]
    fn test_store_and_load() {
        let alloc = FrameAllocator::new(256, 2);
        let sentinel = Sentinel { magic: 0xC0DE, frame: 1 };
        let block = alloc.store(&sentinel).unwrap();
        assert_eq!(alloc.load::<Sentinel>(&block).unwrap(), sentinel);

        let values = [1.5_f32, -2.0, 3.25];
        let block = alloc.store_slice(&values).unwrap();
        assert_eq!(alloc.load_slice::<f32>(&block).unwrap(), values.to_vec());
    }

    #[test]
    fn test_sentinel_survives_one_update_and_dies_after_two() {
        let alloc = FrameAllocator::new(256, 2);
        let block = alloc.store(&Sentinel { magic: 7, frame: 0 }).unwrap();

        alloc.update();
        assert_eq!(alloc.load::<Sentinel>(&block).unwrap().magic, 7);

        alloc.update();
        let err = alloc.load::<Sentinel>(&block).unwrap_err();
        assert_eq!(err, CoreError::StaleFrameBlock { allocated: 0, current: 1 });
    }

    #[test]
    fn test_three_buffers_extend_lifetime() {
        let alloc = FrameAllocator::new(256, 3);
        let block = alloc.store(&42_u64).unwrap();

        alloc.update();
        alloc.update();
        assert_eq!(alloc.load::<u64>(&block).unwrap(), 42);

        alloc.update();
        assert!(alloc.load::<u64>(&block).is_err());
    }

    #[test]
    fn test_update_clears_reused_arena() {
        let alloc = FrameAllocator::new(64, 2);
        let _ = alloc.allocate(48).unwrap();
        alloc.update();
        alloc.update();
        assert_eq!(alloc.active_index(), 0);
        assert_eq!(alloc.used(), 0);
        assert_eq!(alloc.frame(), 2);

        // Recycled memory comes back zeroed.
        let block = alloc.allocate(48).unwrap();
        assert!(alloc.with_bytes(&block, |b| b.iter().all(|&x| x == 0)).unwrap());
    }

    #[test]
    fn test_write_size_checked() {
        let alloc = FrameAllocator::new(64, 2);
        let block = alloc.allocate(4).unwrap();
        let err = alloc.write(&block, &[0; 8]).unwrap_err();
        assert_eq!(err, CoreError::FrameBlockSize { block: 4, needed: 8 });

        assert!(alloc.load::<u64>(&block).is_err());
    }

    #[test]
    #[should_panic(expected = "At least two frame arenas")]
    fn test_single_buffer_panics() {
        let _ = FrameAllocator::new(64, 1);
    }
}
