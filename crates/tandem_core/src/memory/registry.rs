//! # Core Object Registry
//!
//! Tracks objects shared between the simulation and core threads so leaks
//! can be detected when the core thread shuts down.
//!
//! Entries live in a slot map. A [`CoreObjectHandle`] carries the slot index
//! plus a generation counter for detecting stale handles, and the unique
//! ascending [`CoreObjectId`] assigned at registration. IDs are never reused;
//! slots are.

use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use crate::error::{CoreError, CoreResult};

/// Unique ascending identifier of a registered object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct CoreObjectId(u64);

impl CoreObjectId {
    /// Returns the raw identifier.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Stable handle to a registry entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CoreObjectHandle {
    slot: u32,
    generation: u32,
    id: CoreObjectId,
}

impl CoreObjectHandle {
    /// Returns the object's unique identifier.
    #[inline]
    #[must_use]
    pub const fn id(self) -> CoreObjectId {
        self.id
    }

    /// Returns the slot index of the entry.
    #[inline]
    #[must_use]
    pub const fn slot(self) -> u32 {
        self.slot
    }

    /// Returns the generation of the slot when the entry was created.
    #[inline]
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

struct Entry {
    id: CoreObjectId,
    label: String,
    thread: ThreadId,
}

#[derive(Default)]
struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

#[derive(Default)]
struct RegistryInner {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    live: usize,
    next_id: u64,
}

impl RegistryInner {
    fn entry(&self, handle: CoreObjectHandle) -> Option<&Entry> {
        let slot = self.slots.get(handle.slot as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref().filter(|entry| entry.id == handle.id)
    }
}

/// Thread-safe registry of objects shared with the core thread.
///
/// Exactly one entry exists per live object. The registry must be empty when
/// the core thread shuts down.
#[derive(Default)]
pub struct ObjectRegistry {
    inner: Mutex<RegistryInner>,
}

impl ObjectRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an object and assigns it the next ascending ID.
    ///
    /// # Panics
    ///
    /// Panics if more than `u32::MAX` objects are live at once.
    pub fn register_object(&self, label: impl Into<String>) -> CoreObjectHandle {
        let mut inner = self.inner.lock();

        inner.next_id += 1;
        let id = CoreObjectId(inner.next_id);

        let slot = match inner.free_list.pop() {
            Some(slot) => slot,
            None => {
                let slot = u32::try_from(inner.slots.len()).expect("registry slot index overflow");
                inner.slots.push(Slot::default());
                slot
            }
        };

        let entry = Entry {
            id,
            label: label.into(),
            thread: thread::current().id(),
        };
        let record = &mut inner.slots[slot as usize];
        record.entry = Some(entry);
        let generation = record.generation;
        inner.live += 1;

        CoreObjectHandle { slot, generation, id }
    }

    /// Removes an object's entry.
    ///
    /// # Errors
    ///
    /// [`CoreError::UnknownObject`] if the handle is stale or was already
    /// unregistered.
    pub fn unregister_object(&self, handle: CoreObjectHandle) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.entry(handle).is_none() {
            return Err(CoreError::UnknownObject {
                slot: handle.slot,
                generation: handle.generation,
            });
        }

        let record = &mut inner.slots[handle.slot as usize];
        record.entry = None;
        record.generation = record.generation.wrapping_add(1);
        inner.free_list.push(handle.slot);
        inner.live -= 1;
        Ok(())
    }

    /// Returns whether the handle refers to a live entry.
    #[must_use]
    pub fn contains(&self, handle: CoreObjectHandle) -> bool {
        self.inner.lock().entry(handle).is_some()
    }

    /// Returns the label an object was registered with.
    #[must_use]
    pub fn label(&self, handle: CoreObjectHandle) -> Option<String> {
        self.inner.lock().entry(handle).map(|entry| entry.label.clone())
    }

    /// Returns the thread an object was registered from.
    #[must_use]
    pub fn owner_thread(&self, handle: CoreObjectHandle) -> Option<ThreadId> {
        self.inner.lock().entry(handle).map(|entry| entry.thread)
    }

    /// Returns the number of live entries.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.inner.lock().live
    }

    /// Fails if any entry is still live.
    ///
    /// # Errors
    ///
    /// [`CoreError::LeakedObjects`] listing the live labels in ID order.
    pub fn check_leaks(&self) -> CoreResult<()> {
        let inner = self.inner.lock();
        if inner.live == 0 {
            return Ok(());
        }

        let mut live: Vec<&Entry> = inner.slots.iter().filter_map(|s| s.entry.as_ref()).collect();
        live.sort_by_key(|entry| entry.id);
        Err(CoreError::LeakedObjects {
            live: inner.live,
            labels: live.iter().map(|entry| entry.label.clone()).collect(),
        })
    }
}

impl std::fmt::Debug for ObjectRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectRegistry")
            .field("live", &self.live_count())
            .finish()
    }
}
