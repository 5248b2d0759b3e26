//! The public API for embedders.
//!
//! The functions in this module operate on a [`VmArena`] instance: adopt
//! or reserve OS memory as arenas, allocate and free block ranges, run
//! purge passes, and inspect arenas. They are thin, documented wrappers
//! over the instance methods, mirroring the C-style surface of the
//! allocator family this crate belongs to.

use std::io::Result;

use crate::arena::memid::{ArenaId, MemId};
use crate::util::constants::*;
use crate::util::conversions::raw_align_up;
use crate::util::options::Options;
use crate::util::os::{OperatingSystem, OsMemory, OsProcess};
use crate::util::Address;
use crate::VmArena;

/// Create an allocator instance: read option overrides from the
/// environment and initialize logging.
pub fn create<OS: OperatingSystem>(mut options: Options) -> VmArena<OS> {
    options.read_env_var_settings();
    VmArena::new(options)
}

/// Adopt a caller-managed region `[start, start + size)` as a new arena.
/// The region must be aligned to the block size and large enough for the
/// arena metadata plus one block. Returns whether the arena was created.
///
/// The caller keeps ownership: the region is never unmapped by this crate.
pub fn manage_os_memory<OS: OperatingSystem>(
    mgr: &VmArena<OS>,
    start: Address,
    size: usize,
    is_committed: bool,
    is_large: bool,
    is_zero: bool,
    numa_node: Option<u32>,
) -> bool {
    manage_os_memory_ex(
        mgr,
        start,
        size,
        is_committed,
        is_large,
        is_zero,
        numa_node,
        false,
    )
    .is_ok()
}

/// As [`manage_os_memory`], but the new arena may be exclusive, and its id
/// is returned. Fails with EINVAL for misaligned or too-small regions.
#[allow(clippy::too_many_arguments)]
pub fn manage_os_memory_ex<OS: OperatingSystem>(
    mgr: &VmArena<OS>,
    start: Address,
    size: usize,
    is_committed: bool,
    is_large: bool,
    is_zero: bool,
    numa_node: Option<u32>,
    exclusive: bool,
) -> Result<ArenaId> {
    let memid = MemId::external(start, size, is_committed, is_zero, is_large);
    let result = mgr.add_arena(start, size, memid, numa_node, exclusive, is_large);
    if let Err(ref e) = result {
        warn!(
            "cannot adopt region at {} ({} bytes) as an arena: {}",
            start, size, e
        );
    }
    result
}

/// Reserve `size` bytes from the OS (rounded up to whole blocks) and
/// register the range as a new arena.
pub fn reserve_os_memory<OS: OperatingSystem>(
    mgr: &VmArena<OS>,
    size: usize,
    commit: bool,
    allow_large: bool,
) -> Result<()> {
    reserve_os_memory_ex(mgr, size, commit, allow_large, false).map(|_| ())
}

/// As [`reserve_os_memory`], but the new arena may be exclusive, and its
/// id is returned.
pub fn reserve_os_memory_ex<OS: OperatingSystem>(
    mgr: &VmArena<OS>,
    size: usize,
    commit: bool,
    allow_large: bool,
    exclusive: bool,
) -> Result<ArenaId> {
    let size = raw_align_up(size.max(crate::arena::Arena::min_size()), BYTES_IN_BLOCK);
    let alloc = OS::reserve_aligned(size, BLOCK_ALIGN, commit, allow_large)?;
    mgr.stats.reserved.increase(alloc.size);
    if alloc.is_committed {
        mgr.stats.committed.increase(alloc.size);
    }
    let memid = MemId::os(
        alloc.base,
        alloc.size,
        alloc.is_committed,
        alloc.is_zero,
        alloc.is_pinned,
    );
    let id = mgr.add_arena(
        alloc.base,
        alloc.size,
        memid,
        None,
        exclusive,
        alloc.is_large,
    )?;
    info!(
        "reserved arena {}: {} MiB at {}{}",
        id,
        alloc.size >> LOG_BYTES_IN_MBYTE,
        alloc.base,
        if alloc.is_committed { ", committed" } else { "" }
    );
    Ok(id)
}

/// Reserve `pages` 1 GiB huge pages on the given NUMA node as a new
/// arena. Huge pages are pinned and committed for their lifetime.
/// `timeout_msecs <= 0` waits without limit.
pub fn reserve_huge_os_pages_at<OS: OperatingSystem>(
    mgr: &VmArena<OS>,
    pages: usize,
    numa_node: Option<u32>,
    timeout_msecs: i64,
) -> Result<()> {
    reserve_huge_os_pages_at_ex(mgr, pages, numa_node, timeout_msecs, false).map(|_| ())
}

/// As [`reserve_huge_os_pages_at`], but the new arena may be exclusive,
/// and its id is returned.
pub fn reserve_huge_os_pages_at_ex<OS: OperatingSystem>(
    mgr: &VmArena<OS>,
    pages: usize,
    numa_node: Option<u32>,
    timeout_msecs: i64,
    exclusive: bool,
) -> Result<ArenaId> {
    let alloc = OS::alloc_huge_pages(pages, numa_node, timeout_msecs)?;
    mgr.stats.reserved.increase(alloc.size);
    mgr.stats.committed.increase(alloc.size);
    let memid = MemId::os(alloc.base, alloc.size, true, alloc.is_zero, true);
    let id = mgr.add_arena(alloc.base, alloc.size, memid, numa_node, exclusive, true)?;
    info!(
        "reserved {} GiB of huge pages as arena {}{}",
        alloc.size >> LOG_BYTES_IN_GBYTE,
        id,
        match numa_node {
            Some(n) => format!(" on numa node {}", n),
            None => String::new(),
        }
    );
    Ok(id)
}

/// Reserve huge pages spread evenly over NUMA nodes: each node gets
/// `pages / numa_count`, and the first `pages % numa_count` nodes one
/// extra. `numa_count = 0` uses the machine's node count. The per-node
/// timeout is `timeout / numa_count + 50` ms.
pub fn reserve_huge_os_pages_interleave<OS: OperatingSystem>(
    mgr: &VmArena<OS>,
    pages: usize,
    numa_count: u32,
    timeout_msecs: i64,
) -> Result<()> {
    if pages == 0 {
        return Err(std::io::Error::from_raw_os_error(libc::EINVAL));
    }
    let numa_count = if numa_count > 0 {
        numa_count as usize
    } else {
        OS::numa_node_count() as usize
    };
    let pages_per = pages / numa_count;
    let pages_extra = pages % numa_count;
    let node_timeout = if timeout_msecs <= 0 {
        timeout_msecs
    } else {
        timeout_msecs / numa_count as i64 + 50
    };
    for node in 0..numa_count {
        let node_pages = pages_per + usize::from(node < pages_extra);
        if node_pages == 0 {
            continue;
        }
        reserve_huge_os_pages_at(mgr, node_pages, Some(node as u32), node_timeout)?;
    }
    Ok(())
}

/// The base address and size of the arena with the given id.
pub fn arena_area<OS: OperatingSystem>(mgr: &VmArena<OS>, id: ArenaId) -> Option<(Address, usize)> {
    mgr.registry.get(id).map(|arena| arena.area())
}

/// Allocate `size` bytes with the given alignment and offset. See
/// [`VmArena::alloc_aligned`].
pub fn alloc_aligned<OS: OperatingSystem>(
    mgr: &VmArena<OS>,
    size: usize,
    alignment: usize,
    align_offset: usize,
    commit: bool,
    allow_large: bool,
    requested: Option<ArenaId>,
) -> Result<(Address, MemId)> {
    mgr.alloc_aligned(size, alignment, align_offset, commit, allow_large, requested)
}

/// Free memory returned by [`alloc_aligned`]. See [`VmArena::free`].
pub fn free<OS: OperatingSystem>(
    mgr: &VmArena<OS>,
    ptr: Address,
    size: usize,
    committed_size: usize,
    memid: MemId,
) {
    mgr.free(ptr, size, committed_size, memid)
}

/// Run a purge pass over all arenas. See [`VmArena::collect`].
pub fn collect<OS: OperatingSystem>(mgr: &VmArena<OS>, force_purge: bool) {
    mgr.collect(force_purge)
}

/// Print every arena's bitmaps (as lines of `x`/`.`) and totals to
/// stderr.
pub fn debug_show_arenas<OS: OperatingSystem>(
    mgr: &VmArena<OS>,
    show_inuse: bool,
    show_abandoned: bool,
    show_purge: bool,
) {
    eprint!("{}", mgr.format_arenas(show_inuse, show_abandoned, show_purge));
}
