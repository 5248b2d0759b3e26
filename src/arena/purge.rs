//! Lazy purging: freed blocks have their physical memory returned to the
//! OS after a configurable delay, in batches.
//!
//! A free sets the range's bits in `blocks_purge` and arms the arena's
//! expiry clock. A later pass walks the scheduled runs; for each run it
//! transiently re-claims the corresponding free bits, so the allocator
//! cannot hand the blocks out mid-purge, purges whatever is still
//! scheduled, and releases the bits again. The transient claim reuses the
//! bitmap's own atomicity instead of introducing a lock.

use std::sync::atomic::Ordering;

use super::Arena;
use crate::util::conversions::*;
use crate::util::os::{OperatingSystem, OsProcess};
use crate::VmArena;

impl<OS: OperatingSystem> VmArena<OS> {
    /// Schedule `[index, index + n)` of `arena` for purging. The caller
    /// must still own the blocks (their free bits are clear).
    pub(crate) fn schedule_purge(&self, arena: &Arena, index: usize, n: usize) {
        let delay = self.purge_delay();
        if delay < 0 || arena.commit_is_pinned() {
            return;
        }
        if delay == 0 || self.is_bootstrapping() {
            // synchronous purging, nothing to schedule
            self.purge_now(arena, index, n);
            return;
        }
        arena.blocks_purge.set_run(index, n);
        let expire = arena.purge_expire.load(Ordering::Relaxed);
        if expire != 0 {
            // nudge the armed clock a little, batching nearby frees
            arena
                .purge_expire
                .fetch_add(delay / 10, Ordering::AcqRel);
        } else {
            arena
                .purge_expire
                .store(OS::now_msecs() + delay, Ordering::Release);
        }
    }

    /// Purge a range right now. The caller owns the blocks: either they
    /// were never released, or the purge walker holds the transient claim.
    pub(crate) fn purge_now(&self, arena: &Arena, index: usize, n: usize) {
        let start = arena.block_start(index);
        let size = blocks_to_bytes(n);
        let needs_recommit = if arena.blocks_committed.is_run_set(index, n) {
            self.os_purge(start, size, true)
        } else {
            // partially decommitted: resetting uncommitted pages is
            // invalid, force a decommit
            let needs_recommit = self.os_purge(start, size, false);
            if needs_recommit {
                // the wrapper just accounted a full decommit, but the
                // range was not fully committed to begin with
                self.stats.committed.increase(size);
            }
            needs_recommit
        };
        arena.blocks_purge.clear_run(index, n);
        if needs_recommit {
            arena.blocks_committed.clear_run(index, n);
        }
        trace!(
            "purged {} block(s) at {} from arena {}",
            n,
            start,
            arena.id()
        );
    }

    /// Walk the registry and run expired purge schedules. With `force`,
    /// expiry clocks are ignored. Unless `visit_all` is set, at most one
    /// arena is processed per call.
    pub(crate) fn try_purge(&self, force: bool, visit_all: bool) {
        if self.purge_delay() < 0 || self.is_bootstrapping() || self.registry.is_empty() {
            return;
        }
        // one walker at a time; contenders just skip
        if self
            .purge_guard
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let now = OS::now_msecs();
        for arena in self.registry.iter() {
            if self.try_purge_arena(arena, now, force) && !visit_all {
                break;
            }
        }
        self.purge_guard.store(false, Ordering::Release);
    }

    /// Run one arena's purge schedule if it expired. Returns whether any
    /// purging work was attempted.
    fn try_purge_arena(&self, arena: &Arena, now: i64, force: bool) -> bool {
        let expire = arena.purge_expire.load(Ordering::Acquire);
        if expire == 0 {
            return false;
        }
        if !force && expire > now {
            return false;
        }
        // claim the expiry; if another thread beat us to it, the schedule
        // is theirs
        if arena
            .purge_expire
            .compare_exchange(expire, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let mut all_purged = true;
        let mut any_work = false;
        let mut cursor = arena.metadata_blocks;
        while cursor < arena.block_count {
            let Some(run_start) = arena
                .blocks_purge
                .next_set_bit(cursor, arena.block_count)
            else {
                break;
            };
            let run_len = arena
                .blocks_purge
                .run_length_from(run_start, arena.block_count - run_start);
            // transiently take the free bits, shrinking until the
            // allocator lets go of a prefix
            let mut claimed = run_len;
            while claimed > 0 && !arena.blocks_free.try_clear_run(run_start, claimed) {
                claimed -= 1;
            }
            if claimed > 0 {
                any_work = true;
                if claimed < run_len {
                    all_purged = false;
                }
                // reread the schedule: a claim that raced us may have
                // dropped blocks out of it
                self.purge_claimed(arena, run_start, claimed);
                arena.blocks_free.set_run(run_start, claimed);
            } else {
                all_purged = false;
            }
            cursor = run_start + run_len;
        }
        if !all_purged {
            // leftovers keep their schedule; re-arm the clock for them
            let _ = arena.purge_expire.compare_exchange(
                0,
                now + self.purge_delay(),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
        any_work
    }

    /// Purge every still-scheduled sub-run of `[start, start + claimed)`.
    /// The caller holds the transient free-bit claim over the whole range.
    fn purge_claimed(&self, arena: &Arena, start: usize, claimed: usize) {
        let end = start + claimed;
        let mut cursor = start;
        while cursor < end {
            let Some(sub_start) = arena.blocks_purge.next_set_bit(cursor, end) else {
                break;
            };
            let sub_len = arena.blocks_purge.run_length_from(sub_start, end - sub_start);
            self.purge_now(arena, sub_start, sub_len);
            cursor = sub_start + sub_len;
        }
    }

    /// Run a purge pass over all arenas. With `force_purge`, scheduled
    /// purges run even if their delay has not expired yet.
    pub fn collect(&self, force_purge: bool) {
        self.try_purge(force_purge, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::memid::{ArenaId, MemKind};
    use crate::memory_manager;
    use crate::util::constants::*;
    use crate::util::options::Options;
    use crate::util::os::OsMemory;
    use crate::util::test_util::mock_os::MockOs;
    use crate::util::test_util::serial_test;
    use crate::util::Address;

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

    fn alloc_committed(mgr: &VmArena<MockOs>, blocks: usize) -> (Address, crate::MemId) {
        mgr.alloc_aligned(
            blocks * BYTES_IN_BLOCK,
            BLOCK_ALIGN,
            0,
            true,
            false,
            None,
        )
        .unwrap()
    }

    #[test]
    fn synchronous_purge_decommits_at_free() {
        serial_test(|| {
            MockOs::reset();
            // purge_delay=0: purge runs inside free()
            let mgr = manager("arena_reserve=0 disallow_os_alloc=true purge_delay=0");
            let id = adopt(&mgr, 5);
            let arena = mgr.registry.get(id).unwrap();
            let (ptr, memid) = alloc_committed(&mgr, 1);
            assert!(memid.initially_committed());
            unsafe { std::ptr::write_bytes(ptr.to_mut_ptr::<u8>(), 0xab, BYTES_IN_PAGE) };
            let decommits_before = MockOs::decommit_calls();
            mgr.free(ptr, BYTES_IN_BLOCK, BYTES_IN_BLOCK, memid);
            assert_eq!(MockOs::decommit_calls(), decommits_before + 1);
            // the commit bits are gone, the free bits are back
            assert!(arena.blocks_committed.is_run_clear(1, 1));
            assert!(arena.blocks_free.is_run_set(1, 1));
            assert_eq!(arena.blocks_purge.count_set(), 0);
        })
    }

    #[test]
    fn delayed_purge_waits_for_the_clock() {
        serial_test(|| {
            MockOs::reset();
            // effective delay = 10ms * 1
            let mgr =
                manager("arena_reserve=0 disallow_os_alloc=true purge_delay=10 arena_purge_mult=1");
            let id = adopt(&mgr, 5);
            let arena = mgr.registry.get(id).unwrap();
            let (ptr, memid) = alloc_committed(&mgr, 2);
            mgr.free(ptr, 2 * BYTES_IN_BLOCK, 2 * BYTES_IN_BLOCK, memid);
            // scheduled but not yet run; the schedule is a subset of the
            // free bits
            assert_eq!(arena.blocks_purge.count_set(), 2);
            assert!(arena.blocks_free.is_run_set(1, 2));
            assert!(arena.purge_expire.load(Ordering::Relaxed) > 0);
            let decommits = MockOs::decommit_calls();

            // a pass before the expiry does nothing
            mgr.collect(false);
            assert_eq!(arena.blocks_purge.count_set(), 2);
            assert_eq!(MockOs::decommit_calls(), decommits);

            // once the clock passes the expiry the pass purges
            MockOs::advance_clock(100);
            mgr.collect(false);
            assert_eq!(arena.blocks_purge.count_set(), 0);
            assert_eq!(arena.purge_expire.load(Ordering::Relaxed), 0);
            assert!(MockOs::decommit_calls() > decommits);
            assert!(arena.blocks_committed.is_run_clear(1, 2));
            // the blocks are allocatable again
            assert!(arena.blocks_free.is_run_set(1, 2));
        })
    }

    #[test]
    fn forced_collect_ignores_the_clock() {
        serial_test(|| {
            MockOs::reset();
            let mgr =
                manager("arena_reserve=0 disallow_os_alloc=true purge_delay=10 arena_purge_mult=1");
            let _id = adopt(&mgr, 5);
            let (ptr, memid) = alloc_committed(&mgr, 1);
            mgr.free(ptr, BYTES_IN_BLOCK, BYTES_IN_BLOCK, memid);
            let decommits = MockOs::decommit_calls();
            mgr.collect(true);
            assert!(MockOs::decommit_calls() > decommits);
        })
    }

    #[test]
    fn purge_reset_mode_keeps_commit_state() {
        serial_test(|| {
            MockOs::reset();
            let mgr = manager(
                "arena_reserve=0 disallow_os_alloc=true purge_delay=0 purge_decommits=false",
            );
            let id = adopt(&mgr, 5);
            let arena = mgr.registry.get(id).unwrap();
            let (ptr, memid) = alloc_committed(&mgr, 1);
            let resets = MockOs::reset_calls();
            mgr.free(ptr, BYTES_IN_BLOCK, BYTES_IN_BLOCK, memid);
            // reset was used; the pages stay committed
            assert!(MockOs::reset_calls() > resets);
            assert!(arena.blocks_committed.is_run_set(1, 1));
        })
    }

    #[test]
    fn reallocation_after_purge_recommits() {
        serial_test(|| {
            MockOs::reset();
            let mgr = manager("arena_reserve=0 disallow_os_alloc=true purge_delay=0");
            let id = adopt(&mgr, 5);
            let arena = mgr.registry.get(id).unwrap();
            let (ptr, memid) = alloc_committed(&mgr, 1);
            mgr.free(ptr, BYTES_IN_BLOCK, BYTES_IN_BLOCK, memid);
            assert!(arena.blocks_committed.is_run_clear(1, 1));
            let commits = MockOs::commit_calls();
            let (ptr2, memid2) = alloc_committed(&mgr, 1);
            assert_eq!(ptr2, ptr);
            assert!(memid2.initially_committed());
            assert!(MockOs::commit_calls() > commits);
            assert!(arena.blocks_committed.is_run_set(1, 1));
            // the committed-bytes books balance: exactly one block is
            // committed beyond the metadata
            let meta = blocks_to_bytes(arena.metadata_blocks);
            assert_eq!(
                mgr.stats.committed.current(),
                (meta + BYTES_IN_BLOCK) as i64
            );
            assert!(matches!(memid2.kind(), MemKind::Arena { .. }));
        })
    }

    #[test]
    fn purge_skips_blocks_reclaimed_before_the_pass() {
        serial_test(|| {
            MockOs::reset();
            let mgr =
                manager("arena_reserve=0 disallow_os_alloc=true purge_delay=10 arena_purge_mult=1");
            let id = adopt(&mgr, 6);
            let arena = mgr.registry.get(id).unwrap();
            let (ptr, memid) = alloc_committed(&mgr, 4);
            mgr.free(ptr, 4 * BYTES_IN_BLOCK, 4 * BYTES_IN_BLOCK, memid);
            assert_eq!(arena.blocks_purge.count_set(), 4);

            // a claim drops its blocks off the schedule before the pass
            let (ptr2, memid2) = alloc_committed(&mgr, 2);
            assert_eq!(ptr2, ptr);
            assert_eq!(arena.blocks_purge.count_set(), 2);

            MockOs::advance_clock(100);
            mgr.collect(false);
            // only the still-free tail was purged
            assert_eq!(arena.blocks_purge.count_set(), 0);
            assert!(arena.blocks_committed.is_run_set(1, 2));
            assert!(arena.blocks_committed.is_run_clear(3, 2));
            mgr.free(ptr2, 2 * BYTES_IN_BLOCK, 2 * BYTES_IN_BLOCK, memid2);
        })
    }
}
