//! The arena registry: a fixed-capacity, append-mostly array of arenas.
//!
//! Slots are published with release stores after the descriptor is fully
//! initialized; any thread that observes a non-null slot therefore sees a
//! complete arena. The count only grows (arenas are never unregistered
//! outside the unsafe shutdown path), so a relaxed count load is a valid
//! lower bound for scans.

use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use super::memid::{ArenaId, MemKind};
use super::Arena;
use crate::util::constants::MAX_ARENAS;
use crate::util::os::{OperatingSystem, OsMemory};

pub struct ArenaRegistry {
    count: AtomicUsize,
    slots: [AtomicPtr<Arena>; MAX_ARENAS],
}

impl ArenaRegistry {
    pub fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const NULL: AtomicPtr<Arena> = AtomicPtr::new(std::ptr::null_mut());
        ArenaRegistry {
            count: AtomicUsize::new(0),
            slots: [NULL; MAX_ARENAS],
        }
    }

    /// Register a fully initialized arena: reserve a slot, assign the id,
    /// and publish the descriptor. Fails when the registry is full.
    ///
    /// # Safety
    /// `arena` must point to an initialized descriptor that no other
    /// thread references yet, and it must stay valid for the lifetime of
    /// the registry.
    pub(crate) unsafe fn add(&self, arena: *mut Arena) -> Result<ArenaId, ()> {
        let index = self.count.fetch_add(1, Ordering::AcqRel);
        if index >= MAX_ARENAS {
            self.count.fetch_sub(1, Ordering::AcqRel);
            return Err(());
        }
        let id = ArenaId::from_index(index);
        (*arena).id = Some(id);
        self.slots[index].store(arena, Ordering::Release);
        Ok(id)
    }

    /// Look up an arena by id. Returns None for empty slots (an id whose
    /// arena was destroyed) and for ids that were never assigned.
    pub fn get(&self, id: ArenaId) -> Option<&Arena> {
        let ptr = self.slots[id.index()].load(Ordering::Acquire);
        if ptr.is_null() {
            return None;
        }
        Some(unsafe { &*ptr })
    }

    /// A lower bound on the number of registered arenas, suitable for
    /// bounding scans. May miss an arena registered concurrently.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed).min(MAX_ARENAS)
    }

    /// An exact snapshot of the number of registered arenas.
    pub fn len_exact(&self) -> usize {
        self.count.load(Ordering::Acquire).min(MAX_ARENAS)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate the registered arenas in slot order, skipping empty slots.
    pub fn iter(&self) -> impl Iterator<Item = &Arena> {
        let len = self.len();
        (0..len).filter_map(move |i| {
            let ptr = self.slots[i].load(Ordering::Acquire);
            if ptr.is_null() {
                None
            } else {
                Some(unsafe { &*ptr })
            }
        })
    }

    /// Tear down every arena, returning OS-owned ranges to the OS.
    ///
    /// # Safety
    /// No allocation from any arena may still be in use, and no other
    /// thread may touch the registry concurrently. This is the process
    /// shutdown path.
    pub(crate) unsafe fn destroy_all<OS: OperatingSystem>(&self) {
        let len = self.len_exact();
        for i in 0..len {
            let ptr = self.slots[i].swap(std::ptr::null_mut(), Ordering::AcqRel);
            if ptr.is_null() {
                continue;
            }
            // the descriptor lives inside the range being released, so
            // read what we need before unmapping
            let memid = (*ptr).memid;
            if let MemKind::Os { base, size } = memid.kind() {
                OS::release(base, size);
            }
        }
        self.count.store(0, Ordering::Release);
    }
}

impl Default for ArenaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::memid::MemId;
    use crate::util::constants::BLOCK_ALIGN;
    use crate::util::conversions::blocks_to_bytes;
    use crate::util::os::Os;

    fn make_arena(blocks: usize) -> *mut Arena {
        let size = blocks_to_bytes(blocks);
        let alloc = Os::reserve_aligned(size, BLOCK_ALIGN, false, false).unwrap();
        let memid = MemId::os(alloc.base, alloc.size, false, true, false);
        unsafe { Arena::initialize::<Os>(alloc.base, size, memid, None, false, false).unwrap() }
    }

    #[test]
    fn add_assigns_one_based_ids() {
        let registry = ArenaRegistry::new();
        let a = make_arena(4);
        let b = make_arena(4);
        let ia = unsafe { registry.add(a) }.unwrap();
        let ib = unsafe { registry.add(b) }.unwrap();
        assert_eq!(ia.get(), 1);
        assert_eq!(ib.get(), 2);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(ia).unwrap().id(), ia);
        assert_eq!(registry.get(ib).unwrap().id(), ib);
        assert_eq!(registry.iter().count(), 2);
        unsafe { registry.destroy_all::<Os>() };
        assert_eq!(registry.len(), 0);
        assert!(registry.get(ia).is_none());
    }
}
