//! The free path: validation, commit bookkeeping, and releasing blocks
//! back to their arena.

use super::memid::{ArenaId, MemId, MemKind};
use crate::util::conversions::*;
use crate::util::os::{OperatingSystem, OsMemory};
use crate::util::{track, Address};
use crate::VmArena;

impl<OS: OperatingSystem> VmArena<OS> {
    /// Free memory returned by [`VmArena::alloc_aligned`].
    ///
    /// `committed_size` is the number of bytes (from the start of the
    /// range) the caller knows to be committed; pass `size` when the whole
    /// range is. Arena ranges are scheduled for purging and their blocks
    /// released; direct OS ranges are unmapped.
    ///
    /// Freeing never fails. A handle that does not decode to a valid range
    /// is dropped with a warning rather than risking the bitmaps; the
    /// blocks it named leak. Likewise a detected double free leaves all
    /// state as the first free wrote it.
    pub fn free(&self, ptr: Address, size: usize, committed_size: usize, memid: MemId) {
        if ptr.is_zero() || size == 0 {
            return;
        }
        debug_assert!(committed_size <= size);
        match memid.kind() {
            // not ours to unmap
            MemKind::None | MemKind::Static | MemKind::External { .. } => {}
            MemKind::Os { base, size: full } => {
                debug_assert!(base <= ptr && ptr.as_usize() + size <= base.as_usize() + full);
                track::mem_noaccess(ptr, size);
                if memid.initially_committed() || committed_size > 0 {
                    let committed = if memid.initially_committed() {
                        full
                    } else {
                        committed_size
                    };
                    self.stats.committed.decrease(committed);
                }
                self.stats.reserved.decrease(full);
                OS::release(base, full);
            }
            MemKind::Arena { id, block_index, .. } => {
                self.free_arena_blocks(ptr, size, committed_size, id, block_index);
                // take the chance to drain expired purge schedules
                self.try_purge(false, false);
            }
        }
    }

    fn free_arena_blocks(
        &self,
        ptr: Address,
        size: usize,
        committed_size: usize,
        id: ArenaId,
        block_index: usize,
    ) {
        let n = bytes_to_blocks_up(size);
        let Some(arena) = self.registry.get(id) else {
            warn!("invalid free: arena {} does not exist (ptr {})", id, ptr);
            return;
        };
        if block_index < arena.metadata_blocks || block_index + n > arena.block_count {
            warn!(
                "invalid free: blocks [{}, {}) are outside arena {} (ptr {})",
                block_index,
                block_index + n,
                id,
                ptr
            );
            return;
        }
        if arena.block_start(block_index) != ptr {
            warn!(
                "invalid free: {} does not start block {} of arena {}",
                ptr, block_index, id
            );
            return;
        }

        if arena.commit_is_pinned() {
            // the commit state of pinned ranges never changes; the caller
            // must have kept the whole range committed
            assert_eq!(
                committed_size, size,
                "pinned arena ranges are committed for their whole lifetime"
            );
        } else if committed_size < size {
            // the caller decommitted parts of the range; conservatively
            // account the whole range as decommitted so the next claim
            // re-commits it cleanly
            arena.blocks_committed.clear_run(block_index, n);
            track::mem_noaccess(ptr, size);
            if committed_size > 0 {
                self.stats.committed.decrease(committed_size);
            }
        }

        // schedule the purge while the blocks are still ours: the purge
        // walker cannot race a claim before the free bits are set
        self.schedule_purge(arena, block_index, n);

        let transition = arena.blocks_free.set_run(block_index, n);
        if !transition.all {
            warn!(
                "double free of {} block(s) at {} in arena {}",
                n, ptr, id
            );
        } else {
            trace!("released {} block(s) at {} to arena {}", n, ptr, id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::*;
    use crate::util::options::Options;
    use crate::util::test_util::mock_os::MockOs;
    use crate::util::test_util::serial_test;
    use crate::memory_manager;

    fn manager(config: &str) -> VmArena<MockOs> {
        let mut options = Options::default();
        assert!(options.set_bulk_from_command_line(config));
        VmArena::new(options)
    }

    fn adopt(mgr: &VmArena<MockOs>, blocks: usize) -> ArenaId {
        let size = blocks_to_bytes(blocks);
        let alloc = MockOs::reserve_aligned(size, BLOCK_ALIGN, false, false).unwrap();
        memory_manager::manage_os_memory_ex(mgr, alloc.base, size, false, false, true, None, false)
            .unwrap()
    }

    #[test]
    fn free_restores_the_free_bits() {
        serial_test(|| {
            MockOs::reset();
            let mgr = manager("arena_reserve=0 disallow_os_alloc=true purge_delay=-1");
            let id = adopt(&mgr, 5);
            let arena = mgr.registry.get(id).unwrap();
            let before = arena.free_blocks();
            let (ptr, memid) = mgr
                .alloc_aligned(2 * BYTES_IN_BLOCK, BLOCK_ALIGN, 0, false, false, None)
                .unwrap();
            assert_eq!(arena.free_blocks(), before - 2);
            mgr.free(ptr, 2 * BYTES_IN_BLOCK, 0, memid);
            assert_eq!(arena.free_blocks(), before);
            // the same range is reusable
            let (ptr2, memid2) = mgr
                .alloc_aligned(2 * BYTES_IN_BLOCK, BLOCK_ALIGN, 0, false, false, None)
                .unwrap();
            assert_eq!(ptr2, ptr);
            mgr.free(ptr2, 2 * BYTES_IN_BLOCK, 0, memid2);
        })
    }

    #[test]
    fn double_free_is_detected_and_harmless() {
        serial_test(|| {
            MockOs::reset();
            let mgr = manager("arena_reserve=0 disallow_os_alloc=true purge_delay=-1");
            let id = adopt(&mgr, 5);
            let arena = mgr.registry.get(id).unwrap();
            let (ptr, memid) = mgr
                .alloc_aligned(2 * BYTES_IN_BLOCK, BLOCK_ALIGN, 0, false, false, None)
                .unwrap();
            mgr.free(ptr, 2 * BYTES_IN_BLOCK, 0, memid);
            let free_after_first = arena.free_blocks();
            // the second free changes nothing
            mgr.free(ptr, 2 * BYTES_IN_BLOCK, 0, memid);
            assert_eq!(arena.free_blocks(), free_after_first);
            // the range can still be claimed exactly once
            let (p1, _) = mgr
                .alloc_aligned(2 * BYTES_IN_BLOCK, BLOCK_ALIGN, 0, false, false, None)
                .unwrap();
            assert_eq!(p1, ptr);
            assert_eq!(arena.free_blocks(), free_after_first - 2);
        })
    }

    #[test]
    fn invalid_frees_leave_state_alone() {
        serial_test(|| {
            MockOs::reset();
            let mgr = manager("arena_reserve=0 disallow_os_alloc=true purge_delay=-1");
            let id = adopt(&mgr, 5);
            let arena = mgr.registry.get(id).unwrap();
            let before = arena.free_blocks();

            // an arena id that was never assigned
            let bogus = MemId::arena(ArenaId::new(37).unwrap(), 1, false, false);
            mgr.free(arena.block_start(1), BYTES_IN_BLOCK, 0, bogus);
            assert_eq!(arena.free_blocks(), before);

            // a block index inside the metadata blocks
            let bogus = MemId::arena(id, 0, false, false);
            mgr.free(arena.block_start(0), BYTES_IN_BLOCK, 0, bogus);
            assert_eq!(arena.free_blocks(), before);

            // a range running past the end of the arena
            let bogus = MemId::arena(id, 4, false, false);
            mgr.free(arena.block_start(4), 4 * BYTES_IN_BLOCK, 0, bogus);
            assert_eq!(arena.free_blocks(), before);
        })
    }

    #[test]
    fn partially_committed_free_decommits_the_range() {
        serial_test(|| {
            MockOs::reset();
            let mgr = manager("arena_reserve=0 disallow_os_alloc=true purge_delay=-1");
            let id = adopt(&mgr, 5);
            let arena = mgr.registry.get(id).unwrap();
            let (ptr, memid) = mgr
                .alloc_aligned(2 * BYTES_IN_BLOCK, BLOCK_ALIGN, 0, true, false, None)
                .unwrap();
            assert!(memid.initially_committed());
            assert!(arena.blocks_committed.is_run_set(1, 2));
            // the caller decommitted the tail block on its own
            mgr.free(ptr, 2 * BYTES_IN_BLOCK, BYTES_IN_BLOCK, memid);
            // the whole range is accounted decommitted
            assert!(arena.blocks_committed.is_run_clear(1, 2));
        })
    }
}
