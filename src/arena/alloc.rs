//! Allocation: placement policy, per-arena block claims, and eager
//! reservation of fresh arenas.

use std::io::Result;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::bitmap::MAX_BITS_IN_BITMAP;
use super::memid::{ArenaId, MemId};
use super::Arena;
use crate::util::constants::*;
use crate::util::conversions::*;
use crate::util::options::EagerCommit;
use crate::util::os::{OperatingSystem, OsMemory, OsProcess};
use crate::util::{track, Address};
use crate::VmArena;

static NEXT_THREAD_SEQ: AtomicUsize = AtomicUsize::new(0);
thread_local! {
    /// A per-thread sequence number. Used to bias bitmap scans so that
    /// concurrent threads start their claims in different chunks.
    static THREAD_SEQ: usize = NEXT_THREAD_SEQ.fetch_add(1, Ordering::Relaxed);
}

fn thread_seq() -> usize {
    THREAD_SEQ.with(|seq| *seq)
}

/// The reserve size policy for a fresh arena: the configured base,
/// quartered when address space cannot be reserved cheaply, grown
/// geometrically as arenas accumulate, and clamped to what one bitmap can
/// cover.
fn scaled_arena_reserve(base: usize, existing_arenas: usize, cheap_reserve: bool) -> usize {
    let mut reserve = if cheap_reserve { base } else { base / 4 };
    reserve = raw_align_up(reserve, BYTES_IN_BLOCK);
    if (8..=128).contains(&existing_arenas) {
        // a long-running process grows its arenas geometrically; thousands
        // of small arenas would slow every registry scan
        let shift = (existing_arenas / 8).min(16);
        reserve = reserve.saturating_mul(1 << shift);
    }
    reserve.clamp(Arena::min_size(), MAX_BITS_IN_BITMAP * BYTES_IN_BLOCK)
}

impl<OS: OperatingSystem> VmArena<OS> {
    /// Allocate `size` bytes such that `(ptr + align_offset)` is aligned
    /// to `alignment`.
    ///
    /// Requests the arena layer can express (block-compatible alignment,
    /// no offset, a sane size) are served from the registered arenas under
    /// the placement policy: an explicitly requested arena first, then
    /// NUMA-local arenas, then NUMA-foreign ones, then a freshly reserved
    /// arena. Everything else is delegated to the OS, unless direct OS
    /// allocation is disabled.
    ///
    /// With `commit` the returned range is committed; otherwise it is
    /// reserved only (check [`MemId::initially_committed`]).
    pub fn alloc_aligned(
        &self,
        size: usize,
        alignment: usize,
        align_offset: usize,
        commit: bool,
        allow_large: bool,
        requested: Option<ArenaId>,
    ) -> Result<(Address, MemId)> {
        debug_assert!(alignment > 0 && alignment.is_power_of_two());
        debug_assert!(size > 0);
        let arena_compatible = !*self.options.disallow_arena_alloc
            && align_offset == 0
            && alignment <= BLOCK_ALIGN
            && (MIN_OBJ_SIZE..=MAX_OBJ_SIZE).contains(&size);
        if arena_compatible {
            if let Some(r) = self.try_alloc_from_arenas(size, commit, allow_large, requested) {
                return Ok(r);
            }
            // no existing arena could serve the request; reserve a fresh
            // one and retry on it alone
            if requested.is_none() {
                if let Some(id) = self.reserve_more(size, allow_large) {
                    if let Some(arena) = self.registry.get(id) {
                        if let Some(r) = self.try_alloc_at(arena, bytes_to_blocks_up(size), commit)
                        {
                            return Ok(r);
                        }
                    }
                }
            }
        }
        if requested.is_none() && !*self.options.disallow_os_alloc {
            return self.os_alloc(size, alignment, align_offset, commit, allow_large);
        }
        Err(std::io::Error::from_raw_os_error(libc::ENOMEM))
    }

    fn try_alloc_from_arenas(
        &self,
        size: usize,
        commit: bool,
        allow_large: bool,
        requested: Option<ArenaId>,
    ) -> Option<(Address, MemId)> {
        let n = bytes_to_blocks_up(size);
        if let Some(id) = requested {
            // an explicit request pins the arena; its NUMA binding is the
            // caller's own business
            let arena = self.registry.get(id)?;
            if !arena.accepts(Some(id), allow_large) {
                return None;
            }
            return self.try_alloc_at(arena, n, commit);
        }
        // the caller's node only matters on actual multi-node machines
        let caller_node = (OS::numa_node_count() > 1).then(OS::current_numa_node);
        // pass one: arenas local to (or unbound from) the caller's node
        for arena in self.registry.iter() {
            if !arena.accepts(None, allow_large) || !arena.numa_matches(caller_node) {
                continue;
            }
            if let Some(r) = self.try_alloc_at(arena, n, commit) {
                return Some(r);
            }
        }
        // pass two: the arenas skipped above purely for their NUMA binding
        if caller_node.is_some() {
            for arena in self.registry.iter() {
                if !arena.accepts(None, allow_large) || arena.numa_matches(caller_node) {
                    continue;
                }
                if let Some(r) = self.try_alloc_at(arena, n, commit) {
                    return Some(r);
                }
            }
        }
        None
    }

    /// Claim `n` contiguous blocks from one arena and fill in the handle's
    /// commit and zero state.
    pub(crate) fn try_alloc_at(
        &self,
        arena: &Arena,
        n: usize,
        commit: bool,
    ) -> Option<(Address, MemId)> {
        debug_assert!(n > 0);
        let index = arena.blocks_free.try_find_and_clear_run(thread_seq(), n)?;
        // a claimed block drops off the purge schedule immediately; the
        // purge walker rereads the schedule after its own claim
        arena.blocks_purge.clear_run(index, n);
        let ptr = arena.block_start(index);
        let size = blocks_to_bytes(n);
        let mut memid = MemId::arena(arena.id(), index, arena.exclusive, arena.memid.is_pinned());
        if arena.memid.initially_zero() {
            // the caller sees zeroed memory iff the arena started zero and
            // none of these blocks was ever handed out before
            memid.initially_zero = arena.blocks_dirty.set_run(index, n).all;
        }
        if commit {
            memid.initially_committed = true;
            let transition = arena.blocks_committed.set_run(index, n);
            if transition.any {
                match self.os_commit(ptr, size) {
                    Ok(zeroed) => {
                        if zeroed {
                            memid.initially_zero = true;
                        }
                    }
                    Err(e) => {
                        warn!("commit of {} bytes at {} failed: {}", size, ptr, e);
                        // leave the range uncommitted so a later claim
                        // retries the commit
                        arena.blocks_committed.clear_run(index, n);
                        memid.initially_committed = false;
                    }
                }
            }
        } else {
            memid.initially_committed = arena.blocks_committed.is_run_set(index, n);
        }
        track::mem_undefined(ptr, size);
        trace!("claimed {} block(s) at {} from arena {}", n, ptr, arena.id());
        Some((ptr, memid))
    }

    /// Reserve one fresh arena, sized by policy, and register it.
    fn reserve_more(&self, req_size: usize, allow_large: bool) -> Option<ArenaId> {
        let base = *self.options.arena_reserve;
        if base == 0 || self.is_bootstrapping() {
            return None;
        }
        // exact pre-scan: the scaling must see arenas added concurrently
        let existing = self.registry.len_exact();
        let reserve = scaled_arena_reserve(base, existing, OS::has_virtual_reserve());
        if reserve < req_size {
            return None;
        }
        let eager_commit = match *self.options.arena_eager_commit {
            EagerCommit::Always => true,
            EagerCommit::Never => false,
            EagerCommit::Auto => OS::has_overcommit(),
        };
        match crate::memory_manager::reserve_os_memory_ex(
            self,
            reserve,
            eager_commit,
            allow_large,
            false,
        ) {
            Ok(id) => Some(id),
            Err(e) => {
                debug!("could not reserve a fresh arena of {} bytes: {}", reserve, e);
                None
            }
        }
    }

    /// Delegate a request to the OS.
    fn os_alloc(
        &self,
        size: usize,
        alignment: usize,
        align_offset: usize,
        commit: bool,
        allow_large: bool,
    ) -> Result<(Address, MemId)> {
        let rsize = raw_align_up(size, OS::page_size());
        let alignment = alignment.max(OS::page_size());
        let alloc = if align_offset == 0 {
            OS::reserve_aligned(rsize, alignment, commit, allow_large)?
        } else {
            OS::reserve_aligned_at_offset(rsize, alignment, align_offset, commit)?
        };
        self.stats.reserved.increase(alloc.size);
        if alloc.is_committed {
            self.stats.committed.increase(alloc.size);
        }
        let memid = MemId::os(
            alloc.base,
            alloc.size,
            alloc.is_committed,
            alloc.is_zero,
            alloc.is_pinned,
        );
        track::mem_undefined(alloc.addr, size);
        debug!("allocated {} bytes at {} directly from the OS", size, alloc.addr);
        Ok((alloc.addr, memid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::memid::MemKind;
    use crate::memory_manager;
    use crate::util::options::Options;
    use crate::util::test_util::mock_os::MockOs;
    use crate::util::test_util::serial_test;

    fn manager(config: &str) -> VmArena<MockOs> {
        let mut options = Options::default();
        assert!(options.set_bulk_from_command_line(config));
        VmArena::new(options)
    }

    /// Adopt a fresh OS reservation as an arena with the given binding.
    fn adopt(
        mgr: &VmArena<MockOs>,
        blocks: usize,
        numa_node: Option<u32>,
        exclusive: bool,
    ) -> ArenaId {
        let size = blocks_to_bytes(blocks);
        let alloc = MockOs::reserve_aligned(size, BLOCK_ALIGN, false, false).unwrap();
        memory_manager::manage_os_memory_ex(
            mgr, alloc.base, size, false, false, true, numa_node, exclusive,
        )
        .unwrap()
    }

    fn arena_of(memid: &MemId) -> ArenaId {
        match memid.kind() {
            MemKind::Arena { id, .. } => id,
            k => panic!("expected an arena allocation, got {:?}", k),
        }
    }

    #[test]
    fn reserve_scaling_policy() {
        let gib = BYTES_IN_GBYTE;
        // young processes reserve the configured base
        assert_eq!(scaled_arena_reserve(gib, 0, true), gib);
        assert_eq!(scaled_arena_reserve(gib, 7, true), gib);
        // from eight arenas on, the base doubles every eight arenas
        assert_eq!(scaled_arena_reserve(gib, 8, true), 2 * gib);
        assert_eq!(scaled_arena_reserve(gib, 16, true), 4 * gib);
        // the growth is capped by the bitmap capacity
        assert_eq!(
            scaled_arena_reserve(gib, 128, true),
            MAX_BITS_IN_BITMAP * BYTES_IN_BLOCK
        );
        // past the scaling window the base applies again
        assert_eq!(scaled_arena_reserve(gib, 129, true), gib);
        // without cheap virtual reservation the base is quartered
        assert_eq!(scaled_arena_reserve(gib, 0, false), gib / 4);
        // tiny configured bases still cover metadata plus one block
        assert_eq!(scaled_arena_reserve(1, 0, true), Arena::min_size());
    }

    #[test]
    fn numa_local_arenas_are_preferred() {
        serial_test(|| {
            MockOs::reset();
            MockOs::set_numa(0, 2);
            let mgr = manager("arena_reserve=0 disallow_os_alloc=true purge_delay=-1");
            let a = adopt(&mgr, 3, Some(0), false); // two user blocks
            let b = adopt(&mgr, 3, Some(1), false);

            // the node-0 arena fills up first
            for _ in 0..2 {
                let (_, memid) = mgr
                    .alloc_aligned(BYTES_IN_BLOCK, BLOCK_ALIGN, 0, false, false, None)
                    .unwrap();
                assert_eq!(arena_of(&memid), a);
            }
            // only then does the node-1 arena serve the caller
            let (_, memid) = mgr
                .alloc_aligned(BYTES_IN_BLOCK, BLOCK_ALIGN, 0, false, false, None)
                .unwrap();
            assert_eq!(arena_of(&memid), b);
            // both exhausted: the request fails (no OS fallback here)
            assert!(mgr
                .alloc_aligned(BYTES_IN_BLOCK, BLOCK_ALIGN, 0, false, false, None)
                .is_err());
        })
    }

    #[test]
    fn exclusive_arenas_require_their_id() {
        serial_test(|| {
            MockOs::reset();
            let mgr = manager("arena_reserve=0 disallow_os_alloc=true purge_delay=-1");
            let id = adopt(&mgr, 3, None, true);

            // anonymous requests never land in an exclusive arena
            assert!(mgr
                .alloc_aligned(BYTES_IN_BLOCK, BLOCK_ALIGN, 0, false, false, None)
                .is_err());
            // naming the arena works
            let (_, memid) = mgr
                .alloc_aligned(BYTES_IN_BLOCK, BLOCK_ALIGN, 0, false, false, Some(id))
                .unwrap();
            assert_eq!(arena_of(&memid), id);
            assert!(memid.kind() == MemKind::Arena { id, block_index: 1, exclusive: true });
        })
    }

    #[test]
    fn oversized_alignment_goes_to_the_os() {
        serial_test(|| {
            MockOs::reset();
            let mgr = manager("arena_reserve=0 purge_delay=-1");
            let alignment = 2 * BLOCK_ALIGN;
            let (ptr, memid) = mgr
                .alloc_aligned(BYTES_IN_BLOCK, alignment, 0, false, false, None)
                .unwrap();
            assert!(ptr.is_aligned_to(alignment));
            assert!(matches!(memid.kind(), MemKind::Os { .. }));
            mgr.free(ptr, BYTES_IN_BLOCK, 0, memid);
        })
    }

    #[test]
    fn requests_batch_into_contiguous_blocks() {
        serial_test(|| {
            MockOs::reset();
            let mgr = manager("arena_reserve=0 disallow_os_alloc=true purge_delay=-1");
            let id = adopt(&mgr, 6, None, false); // five user blocks
            let (ptr, memid) = mgr
                .alloc_aligned(2 * BYTES_IN_BLOCK + 1, BLOCK_ALIGN, 0, false, false, None)
                .unwrap();
            // rounded up to three whole blocks
            let arena = mgr.registry.get(id).unwrap();
            assert_eq!(arena.free_blocks(), 5 - 3);
            assert!(ptr.is_aligned_to(BLOCK_ALIGN));
            assert_eq!(arena_of(&memid), id);
        })
    }
}
