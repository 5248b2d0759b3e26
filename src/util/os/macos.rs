use std::io::Result;

use super::posix;
use super::{OperatingSystem, OsAllocation, OsMemory, OsProcess};
use crate::util::Address;

/// The macOS OS binding. Plain POSIX; no huge pages, a single NUMA node.
pub struct MacOs;

impl OperatingSystem for MacOs {}

impl OsMemory for MacOs {
    fn reserve_aligned(
        size: usize,
        alignment: usize,
        commit: bool,
        _allow_large: bool,
    ) -> Result<OsAllocation> {
        let base = posix::reserve_aligned(size, alignment, commit, 0)?;
        Ok(OsAllocation {
            addr: base,
            base,
            size,
            is_committed: commit,
            is_zero: true,
            is_pinned: false,
            is_large: false,
        })
    }

    fn alloc_huge_pages(
        _pages: usize,
        _numa_node: Option<u32>,
        _timeout_msecs: i64,
    ) -> Result<OsAllocation> {
        Err(std::io::Error::from_raw_os_error(libc::ENOTSUP))
    }

    fn commit(start: Address, size: usize) -> Result<bool> {
        posix::commit(start, size)
    }

    fn decommit(start: Address, size: usize) -> Result<()> {
        posix::decommit(start, size)
    }

    fn reset(start: Address, size: usize) -> Result<()> {
        posix::reset(start, size)
    }

    fn protect(start: Address, size: usize) -> Result<()> {
        posix::mprotect(start, size, libc::PROT_NONE)
    }

    fn release(start: Address, size: usize) {
        if let Err(e) = posix::munmap(start, size) {
            warn!("failed to unmap {} bytes at {}: {}", size, start, e);
        }
    }

    fn page_size() -> usize {
        posix::page_size()
    }

    fn has_overcommit() -> bool {
        false
    }

    fn has_virtual_reserve() -> bool {
        true
    }
}

impl OsProcess for MacOs {
    fn current_numa_node() -> u32 {
        0
    }

    fn numa_node_count() -> u32 {
        1
    }
}
