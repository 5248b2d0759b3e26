//! Arenas: large contiguous OS reservations carved into fixed-size blocks.
//!
//! An arena's descriptor is self-hosted: it lives in the first blocks of
//! the range it describes, so destroying the arena frees its metadata with
//! it. Four bitmaps over the block range track the free / committed /
//! dirty / scheduled-for-purge state of every block; `blocks_free` is the
//! single source of truth for ownership, and all claims go through it.

use std::io::Result;
use std::mem;
use std::sync::atomic::AtomicI64;
use std::sync::Mutex;

pub mod bitmap;
pub mod memid;
pub mod registry;

pub(crate) mod alloc;
pub(crate) mod free;
pub(crate) mod inspect;
pub(crate) mod purge;

use self::bitmap::{Bitmap, MAX_BITS_IN_BITMAP};
use self::memid::{ArenaId, MemId};

use crate::util::constants::*;
use crate::util::conversions::*;
use crate::util::os::{OperatingSystem, OsMemory};
use crate::util::Address;

/// One arena: a block-aligned range `[start, start + block_count * BLOCK)`
/// of address space with self-hosted metadata at its base.
pub struct Arena {
    /// How the underlying range was obtained.
    pub(crate) memid: MemId,
    /// The registry id, set when the arena is registered (before the
    /// descriptor is published to other threads).
    pub(crate) id: Option<ArenaId>,
    /// Base of the range. Identical to the descriptor's own address.
    pub(crate) start: Address,
    /// Number of blocks in the range, including the metadata blocks.
    pub(crate) block_count: usize,
    /// Number of leading blocks holding this descriptor and the guard page.
    pub(crate) metadata_blocks: usize,
    /// The NUMA node the range is bound to, if any.
    pub(crate) numa_node: Option<u32>,
    /// An exclusive arena only serves requests naming its id.
    pub(crate) exclusive: bool,
    /// Is the range backed by large/huge OS pages (pinned and committed)?
    pub(crate) is_large: bool,
    /// Absolute time in ms after which scheduled purges should run;
    /// 0 = none pending.
    pub(crate) purge_expire: AtomicI64,
    /// A set bit marks a free block, available to claim.
    pub(crate) blocks_free: Bitmap,
    /// A set bit marks a block whose physical backing is committed.
    pub(crate) blocks_committed: Bitmap,
    /// A set bit marks a block that may contain non-zero bytes.
    pub(crate) blocks_dirty: Bitmap,
    /// A set bit marks a free block scheduled for purging.
    pub(crate) blocks_purge: Bitmap,
    /// Per-bin abandoned-block bitmaps. The abandoned-visit protocol lives
    /// outside this crate; the state is reserved here.
    #[allow(dead_code)]
    pub(crate) blocks_abandoned: [Bitmap; BIN_COUNT],
    /// Guards the abandoned-visit walk. Reserved, as above.
    #[allow(dead_code)]
    pub(crate) abandoned_visit_lock: Mutex<()>,
}

impl Arena {
    /// The number of leading blocks reserved for the descriptor plus a
    /// trailing guard page.
    pub(crate) fn metadata_blocks() -> usize {
        bytes_to_blocks_up(mem::size_of::<Arena>() + BYTES_IN_PAGE)
    }

    /// The smallest range an arena can manage: metadata plus one block.
    pub(crate) fn min_size() -> usize {
        blocks_to_bytes(Self::metadata_blocks() + 1)
    }

    /// Place a descriptor for `[start, start + size)` at `start` and
    /// initialize its bitmaps. The arena is not yet registered; the caller
    /// publishes it through the registry.
    ///
    /// # Safety
    /// The caller must own the range, and nothing may reference it yet.
    pub(crate) unsafe fn initialize<OS: OperatingSystem>(
        start: Address,
        size: usize,
        memid: MemId,
        numa_node: Option<u32>,
        exclusive: bool,
        is_large: bool,
    ) -> Result<*mut Arena> {
        if !is_block_aligned(start) || size < Self::min_size() {
            return Err(std::io::Error::from_raw_os_error(libc::EINVAL));
        }
        let meta = Self::metadata_blocks();
        let meta_bytes = blocks_to_bytes(meta);
        let mut block_count = size >> LOG_BYTES_IN_BLOCK;
        if block_count > MAX_BITS_IN_BITMAP {
            debug!(
                "range of {} blocks exceeds the bitmap capacity, tail {} blocks unused",
                block_count,
                block_count - MAX_BITS_IN_BITMAP
            );
            block_count = MAX_BITS_IN_BITMAP;
        }

        if !memid.initially_committed() {
            OS::commit(start, meta_bytes)?;
        }
        if !memid.initially_zero() {
            OS::zero(start, meta_bytes);
        }

        #[allow(clippy::declare_interior_mutable_const)]
        const EMPTY: Bitmap = Bitmap::new();
        let descriptor = start.to_mut_ptr::<Arena>();
        descriptor.write(Arena {
            memid,
            id: None,
            start,
            block_count,
            metadata_blocks: meta,
            numa_node,
            exclusive,
            is_large,
            purge_expire: AtomicI64::new(0),
            blocks_free: Bitmap::new(),
            blocks_committed: Bitmap::new(),
            blocks_dirty: Bitmap::new(),
            blocks_purge: Bitmap::new(),
            blocks_abandoned: [EMPTY; BIN_COUNT],
            abandoned_visit_lock: Mutex::new(()),
        });

        let arena = &mut *descriptor;
        // the metadata blocks stay marked in-use forever
        arena.blocks_free.set_run_mut(meta, block_count - meta);
        if memid.initially_committed() {
            arena.blocks_committed.set_run_mut(0, block_count);
        } else {
            arena.blocks_committed.set_run_mut(0, meta);
        }
        // the descriptor itself makes the metadata blocks dirty
        arena.blocks_dirty.set_run_mut(0, meta);

        // guard page at the end of the metadata span
        let guard = start + meta_bytes - BYTES_IN_PAGE;
        if let Err(e) = OS::protect(guard, BYTES_IN_PAGE) {
            warn!("could not protect arena guard page at {}: {}", guard, e);
        }

        Ok(descriptor)
    }

    /// The id of this (registered) arena.
    pub fn id(&self) -> ArenaId {
        debug_assert!(self.id.is_some(), "arena queried before registration");
        self.id.expect("arena is not registered")
    }

    /// The address of block `index`.
    pub fn block_start(&self, index: usize) -> Address {
        debug_assert!(index <= self.block_count);
        self.start + blocks_to_bytes(index)
    }

    /// The full range of the arena as `(base, size_bytes)`.
    pub fn area(&self) -> (Address, usize) {
        (self.start, blocks_to_bytes(self.block_count))
    }

    /// Does the arena's range contain `ptr`?
    pub fn contains(&self, ptr: Address) -> bool {
        let (base, size) = self.area();
        base <= ptr && ptr < base + size
    }

    /// The number of blocks currently available to claim.
    pub fn free_blocks(&self) -> usize {
        self.blocks_free.count_set()
    }

    /// Is the commit state of this arena's blocks immutable?
    pub(crate) fn commit_is_pinned(&self) -> bool {
        self.is_large || self.memid.is_pinned()
    }

    /// Can this arena serve a request? Exclusive arenas only accept
    /// requests naming them; large-page arenas require `allow_large`.
    pub(crate) fn accepts(&self, requested: Option<ArenaId>, allow_large: bool) -> bool {
        if self.is_large && !allow_large {
            return false;
        }
        match requested {
            Some(id) => self.id == Some(id),
            None => !self.exclusive,
        }
    }

    /// Does the arena's NUMA binding match the caller's node? Unbound
    /// arenas and callers without a known node always match.
    pub(crate) fn numa_matches(&self, caller_node: Option<u32>) -> bool {
        match (self.numa_node, caller_node) {
            (Some(a), Some(c)) => a == c,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::os::Os;

    fn reserve(blocks: usize) -> (Address, usize) {
        let size = blocks_to_bytes(blocks);
        let alloc = Os::reserve_aligned(size, BLOCK_ALIGN, false, false).unwrap();
        (alloc.base, alloc.size)
    }

    #[test]
    fn descriptor_fits_in_metadata_blocks() {
        assert!(mem::size_of::<Arena>() + BYTES_IN_PAGE <= blocks_to_bytes(Arena::metadata_blocks()));
        assert_eq!(Arena::metadata_blocks(), 1);
    }

    #[test]
    fn initialize_seeds_the_bitmaps() {
        let (start, size) = reserve(8);
        let memid = MemId::os(start, size, false, true, false);
        let arena =
            unsafe { &*Arena::initialize::<Os>(start, size, memid, None, false, false).unwrap() };
        let meta = arena.metadata_blocks;
        assert_eq!(arena.block_count, 8);
        // metadata blocks are never claimable and always committed
        assert!(arena.blocks_free.is_run_clear(0, meta));
        assert!(arena.blocks_committed.is_run_set(0, meta));
        assert!(arena.blocks_dirty.is_run_set(0, meta));
        // user blocks are free and (here) uncommitted
        assert!(arena.blocks_free.is_run_set(meta, 8 - meta));
        assert!(arena.blocks_committed.is_run_clear(meta, 8 - meta));
        assert_eq!(arena.free_blocks(), 8 - meta);
        // tail past block_count is not claimable
        assert!(arena
            .blocks_free
            .is_run_clear(8, MAX_BITS_IN_BITMAP - 8));
        Os::release(start, size);
    }

    #[test]
    fn initialize_rejects_bad_ranges() {
        let (start, size) = reserve(8);
        let memid = MemId::os(start, size, false, true, false);
        // misaligned start
        let r = unsafe {
            Arena::initialize::<Os>(start + BYTES_IN_PAGE, size, memid, None, false, false)
        };
        assert!(r.is_err());
        // too small: metadata only, no user block
        let r = unsafe {
            Arena::initialize::<Os>(
                start,
                blocks_to_bytes(Arena::metadata_blocks()),
                memid,
                None,
                false,
                false,
            )
        };
        assert!(r.is_err());
        Os::release(start, size);
    }

    #[test]
    fn geometry_queries() {
        let (start, size) = reserve(6);
        let memid = MemId::os(start, size, true, true, false);
        let arena =
            unsafe { &*Arena::initialize::<Os>(start, size, memid, Some(0), false, false).unwrap() };
        assert_eq!(arena.block_start(0), start);
        assert_eq!(arena.block_start(2), start + 2 * BYTES_IN_BLOCK);
        assert_eq!(arena.area(), (start, 6 * BYTES_IN_BLOCK));
        assert!(arena.contains(start + 5 * BYTES_IN_BLOCK));
        assert!(!arena.contains(start + 6 * BYTES_IN_BLOCK));
        // an initially committed range is committed throughout
        assert!(arena.blocks_committed.is_run_set(0, 6));
        Os::release(start, size);
    }
}
