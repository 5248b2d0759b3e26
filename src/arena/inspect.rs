//! Debug introspection: render arenas and their bitmaps as text.

use std::fmt::Write;

use super::memid::ArenaId;
use super::Arena;
use crate::util::constants::*;
use crate::util::os::OperatingSystem;
use crate::VmArena;

/// A point-in-time summary of one arena, for tests and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaSnapshot {
    pub block_count: usize,
    pub metadata_blocks: usize,
    pub free_blocks: usize,
    pub committed_blocks: usize,
    pub purge_scheduled_blocks: usize,
    pub numa_node: Option<u32>,
    pub exclusive: bool,
    pub is_large: bool,
}

/// Render one bitmap-derived row per 64 blocks, `x` for set.
fn push_bit_rows(out: &mut String, label: &str, block_count: usize, bit: impl Fn(usize) -> bool) {
    const ROW: usize = 64;
    let _ = writeln!(out, "  {}:", label);
    let mut index = 0;
    while index < block_count {
        let end = (index + ROW).min(block_count);
        let mut row = String::with_capacity(ROW);
        for i in index..end {
            row.push(if bit(i) { 'x' } else { '.' });
        }
        let _ = writeln!(out, "    {:5}: {}", index, row);
        index = end;
    }
}

impl<OS: OperatingSystem> VmArena<OS> {
    /// A summary of the arena with the given id.
    pub fn arena_snapshot(&self, id: ArenaId) -> Option<ArenaSnapshot> {
        let arena = self.registry.get(id)?;
        Some(ArenaSnapshot {
            block_count: arena.block_count,
            metadata_blocks: arena.metadata_blocks,
            free_blocks: arena.free_blocks(),
            committed_blocks: arena.blocks_committed.count_set(),
            purge_scheduled_blocks: arena.blocks_purge.count_set(),
            numa_node: arena.numa_node,
            exclusive: arena.exclusive,
            is_large: arena.is_large,
        })
    }

    /// Render every arena's bitmaps as lines of `x`/`.` plus totals.
    /// `show_inuse` prints the allocated blocks (the inverse of the free
    /// bitmap), `show_abandoned` the reserved abandoned bins,
    /// `show_purge` the purge schedule.
    pub fn format_arenas(
        &self,
        show_inuse: bool,
        show_abandoned: bool,
        show_purge: bool,
    ) -> String {
        let mut out = String::new();
        let mut arena_total = 0;
        let mut block_total = 0;
        let mut inuse_total = 0;
        for arena in self.registry.iter() {
            arena_total += 1;
            block_total += arena.block_count;
            let inuse = arena.block_count - arena.free_blocks() - arena.metadata_blocks;
            inuse_total += inuse;
            let _ = writeln!(
                out,
                "arena {}: {} blocks of {} MiB ({} in use, {} metadata{}{}{})",
                arena.id(),
                arena.block_count,
                BYTES_IN_BLOCK >> LOG_BYTES_IN_MBYTE,
                inuse,
                arena.metadata_blocks,
                match arena.numa_node {
                    Some(n) => format!(", numa {}", n),
                    None => String::new(),
                },
                if arena.exclusive { ", exclusive" } else { "" },
                if arena.is_large { ", large pages" } else { "" },
            );
            if show_inuse {
                push_bit_rows(&mut out, "inuse", arena.block_count, |i| {
                    !arena.blocks_free.bit(i)
                });
            }
            if show_purge {
                push_bit_rows(&mut out, "purge", arena.block_count, |i| {
                    arena.blocks_purge.bit(i)
                });
            }
            if show_abandoned {
                let scheduled: usize = abandoned_count(arena);
                let _ = writeln!(out, "  abandoned: {} across {} bins", scheduled, BIN_COUNT);
            }
        }
        let _ = writeln!(
            out,
            "total: {} arena(s), {} block(s), {} in use",
            arena_total, block_total, inuse_total
        );
        out
    }
}

fn abandoned_count(arena: &Arena) -> usize {
    arena
        .blocks_abandoned
        .iter()
        .map(|bin| bin.count_set())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::memid::MemId;
    use crate::memory_manager;
    use crate::util::conversions::blocks_to_bytes;
    use crate::util::options::Options;
    use crate::util::test_util::mock_os::MockOs;
    use crate::util::test_util::serial_test;
    use crate::util::os::OsMemory;

    #[test]
    fn formatting_counts_the_marks() {
        serial_test(|| {
            MockOs::reset();
            let mut options = Options::default();
            assert!(options
                .set_bulk_from_command_line("arena_reserve=0 disallow_os_alloc=true purge_delay=-1"));
            let mgr = VmArena::<MockOs>::new(options);
            let size = blocks_to_bytes(5);
            let alloc = MockOs::reserve_aligned(size, BLOCK_ALIGN, false, false).unwrap();
            let id = memory_manager::manage_os_memory_ex(
                &mgr, alloc.base, size, false, false, true, None, false,
            )
            .unwrap();

            let (ptr, memid) = mgr
                .alloc_aligned(2 * BYTES_IN_BLOCK, BLOCK_ALIGN, 0, false, false, None)
                .unwrap();

            let snapshot = mgr.arena_snapshot(id).unwrap();
            assert_eq!(snapshot.block_count, 5);
            assert_eq!(snapshot.metadata_blocks, 1);
            assert_eq!(snapshot.free_blocks, 2);

            let text = mgr.format_arenas(true, true, true);
            // 1 metadata block + 2 allocated blocks show as 'x'
            assert_eq!(text.matches('x').count(), 3);
            assert!(text.contains("arena #1: 5 blocks"));
            assert!(text.contains("2 in use"));
            assert!(text.contains("abandoned: 0 across"));
            assert!(text.contains("total: 1 arena(s), 5 block(s), 2 in use"));

            mgr.free(ptr, 2 * BYTES_IN_BLOCK, 0, memid);
            let text = mgr.format_arenas(true, false, false);
            assert_eq!(text.matches('x').count(), 1);

            // memids for unrelated kinds render nothing here; just make
            // sure the snapshot of a missing arena is None
            assert!(mgr.arena_snapshot(crate::ArenaId::new(9).unwrap()).is_none());
            let _ = MemId::none();
        })
    }
}
