use std::io::Result;

use super::posix;
use super::{OperatingSystem, OsAllocation, OsMemory, OsProcess};
use crate::util::Address;

/// The Linux OS binding.
pub struct LinuxOs;

impl OperatingSystem for LinuxOs {}

const GIB: usize = 1 << 30;

impl OsMemory for LinuxOs {
    fn reserve_aligned(
        size: usize,
        alignment: usize,
        commit: bool,
        allow_large: bool,
    ) -> Result<OsAllocation> {
        if allow_large && commit {
            // try transparent large pages first; fall back silently
            if let Ok(alloc) = Self::reserve_large(size, alignment) {
                return Ok(alloc);
            }
        }
        let extra = if commit { 0 } else { libc::MAP_NORESERVE };
        let base = posix::reserve_aligned(size, alignment, commit, extra)?;
        set_vma_name(base, size, "vmarena:arena");
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
        pages: usize,
        numa_node: Option<u32>,
        timeout_msecs: i64,
    ) -> Result<OsAllocation> {
        if pages == 0 {
            return Err(std::io::Error::from_raw_os_error(libc::EINVAL));
        }
        let total = pages * GIB;
        // reserve the whole range up front so the pages end up contiguous
        let start = posix::reserve_aligned(total, GIB, false, libc::MAP_NORESERVE)?;
        let deadline = if timeout_msecs <= 0 {
            None
        } else {
            Some(Self::now_msecs() + timeout_msecs)
        };
        let flags = libc::MAP_PRIVATE
            | libc::MAP_ANON
            | libc::MAP_FIXED
            | libc::MAP_HUGETLB
            | libc::MAP_HUGE_1GB;
        let mut got = 0;
        while got < pages {
            let at = start + got * GIB;
            match posix::mmap(at, GIB, libc::PROT_READ | libc::PROT_WRITE, flags) {
                Ok(p) if p == at => {
                    numa_bind(p, GIB, numa_node);
                    got += 1;
                }
                Ok(p) => {
                    // the kernel placed the page elsewhere; give it back
                    let _ = posix::munmap(p, GIB);
                    break;
                }
                Err(e) => {
                    debug!("huge page allocation stopped after {} pages: {}", got, e);
                    break;
                }
            }
            if let Some(deadline) = deadline {
                if Self::now_msecs() > deadline {
                    warn!("huge page reservation timed out after {} pages", got);
                    break;
                }
            }
        }
        if got == 0 {
            let _ = posix::munmap(start, total);
            return Err(std::io::Error::from_raw_os_error(libc::ENOMEM));
        }
        if got < pages {
            // trim the unused tail of the reservation
            let _ = posix::munmap(start + got * GIB, (pages - got) * GIB);
        }
        set_vma_name(start, got * GIB, "vmarena:hugepages");
        Ok(OsAllocation {
            addr: start,
            base: start,
            size: got * GIB,
            is_committed: true,
            is_zero: true,
            is_pinned: true,
            is_large: true,
        })
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
        lazy_static! {
            // /proc/sys/vm/overcommit_memory: 0 = heuristic, 1 = always,
            // 2 = strict accounting
            static ref OVERCOMMIT: bool = std::fs::read_to_string("/proc/sys/vm/overcommit_memory")
                .ok()
                .and_then(|s| s.trim().parse::<i32>().ok())
                .map(|v| v == 0 || v == 1)
                .unwrap_or(true);
        }
        *OVERCOMMIT
    }

    fn has_virtual_reserve() -> bool {
        true
    }
}

impl OsProcess for LinuxOs {
    fn current_numa_node() -> u32 {
        let mut cpu: libc::c_uint = 0;
        let mut node: libc::c_uint = 0;
        let err = unsafe {
            libc::syscall(
                libc::SYS_getcpu,
                &mut cpu as *mut libc::c_uint,
                &mut node as *mut libc::c_uint,
                std::ptr::null_mut::<libc::c_void>(),
            )
        };
        if err != 0 {
            return 0;
        }
        node
    }

    fn numa_node_count() -> u32 {
        lazy_static! {
            static ref NODE_COUNT: u32 = {
                let mut count = 0;
                if let Ok(entries) = std::fs::read_dir("/sys/devices/system/node") {
                    for entry in entries.flatten() {
                        let name = entry.file_name();
                        let name = name.to_string_lossy();
                        if let Some(rest) = name.strip_prefix("node") {
                            if rest.chars().all(|c| c.is_ascii_digit()) {
                                count += 1;
                            }
                        }
                    }
                }
                count.max(1)
            };
        }
        *NODE_COUNT
    }
}

impl LinuxOs {
    /// Commit `size` bytes backed by 2 MiB huge pages. Used for
    /// `allow_large` requests; the caller falls back to normal pages on
    /// failure.
    fn reserve_large(size: usize, alignment: usize) -> Result<OsAllocation> {
        const LARGE_PAGE: usize = 2 << 20;
        if size % LARGE_PAGE != 0 || alignment % LARGE_PAGE != 0 {
            return Err(std::io::Error::from_raw_os_error(libc::EINVAL));
        }
        let flags = libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_HUGETLB;
        let hint = super::aligned_hint(size).unwrap_or(Address::ZERO);
        let base = posix::mmap(hint, size, libc::PROT_READ | libc::PROT_WRITE, flags)?;
        if !base.is_aligned_to(alignment) {
            let _ = posix::munmap(base, size);
            return Err(std::io::Error::from_raw_os_error(libc::EINVAL));
        }
        set_vma_name(base, size, "vmarena:large");
        Ok(OsAllocation {
            addr: base,
            base,
            size,
            is_committed: true,
            is_zero: true,
            is_pinned: true,
            is_large: true,
        })
    }
}

/// Set a human-readable name for an anonymous mapping.
///
/// `PR_SET_VMA` is new in Linux 5.17. When running on an older kernel the
/// call returns `EINVAL`; since the name is only for debugging we log the
/// error instead of failing the reservation.
fn set_vma_name(start: Address, size: usize, name: &str) {
    let Ok(cstr) = std::ffi::CString::new(name) else {
        return;
    };
    let result = posix::wrap_libc_call(
        &|| unsafe {
            libc::prctl(
                libc::PR_SET_VMA,
                libc::PR_SET_VMA_ANON_NAME,
                start.to_ptr::<libc::c_void>(),
                size,
                cstr.as_ptr(),
            )
        },
        0,
    );
    if let Err(e) = result {
        debug!("Error while calling prctl: {e}");
    }
}

/// Bind a range to a NUMA node with a preferred-node policy. Best effort.
fn numa_bind(start: Address, size: usize, node: Option<u32>) {
    const MPOL_PREFERRED: usize = 1;
    let Some(node) = node else { return };
    if node >= 64 {
        return;
    }
    let mask: u64 = 1 << node;
    let err = unsafe {
        libc::syscall(
            libc::SYS_mbind,
            start.to_mut_ptr::<libc::c_void>(),
            size,
            MPOL_PREFERRED,
            &mask as *const u64,
            64usize,
            0usize,
        )
    };
    if err != 0 {
        debug!("mbind to node {} failed: {}", node, std::io::Error::last_os_error());
    }
}
