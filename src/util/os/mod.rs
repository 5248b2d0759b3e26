//! Operating system abstractions for the arena layer.
//!
//! The arena code is generic over an [`OperatingSystem`] binding so that
//! tests can substitute a counting/faking implementation. The default
//! binding for the build platform is exported as [`Os`].
//!
//! Note:
//! 1. For functions that return `Result`, an error value should only be used
//!    for exceptional cases. If a function returns a placeholder value, that
//!    should not be considered an 'exceptional case', and should return Ok.
//! 2. Some functions allow fallback behaviors for platforms where certain
//!    features (huge pages, NUMA placement) are not supported.

use std::io::Result;
use std::time::Instant;

use atomic::{Atomic, Ordering};

use crate::util::constants::BYTES_IN_BLOCK;
use crate::util::conversions::raw_align_up;
use crate::util::Address;

#[cfg(unix)]
mod posix;

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod linux;
        /// The default OS binding for this platform.
        pub type Os = linux::LinuxOs;
    } else if #[cfg(target_os = "macos")] {
        mod macos;
        /// The default OS binding for this platform.
        pub type Os = macos::MacOs;
    }
}

/// The result of reserving memory from the OS.
///
/// `addr` is the pointer that satisfies the request; `base`/`size` describe
/// the whole underlying reservation and must be passed back to
/// [`OsMemory::release`] when the memory is returned.
#[derive(Debug, Clone, Copy)]
pub struct OsAllocation {
    /// The pointer satisfying the requested alignment (and offset).
    pub addr: Address,
    /// Base of the underlying reservation.
    pub base: Address,
    /// Size in bytes of the underlying reservation.
    pub size: usize,
    /// Is the range backed by physical memory already?
    pub is_committed: bool,
    /// Is the range known to be zero-filled?
    pub is_zero: bool,
    /// Is the commit state of the range immutable (e.g. huge pages)?
    pub is_pinned: bool,
    /// Is the range backed by large/huge OS pages?
    pub is_large: bool,
}

/// Abstraction for OS memory operations.
pub trait OsMemory {
    /// Set a memory region to zero.
    fn zero(start: Address, len: usize) {
        Self::set(start, 0, len);
    }

    /// Set a memory region to a specific value.
    fn set(start: Address, val: u8, len: usize) {
        unsafe {
            std::ptr::write_bytes::<u8>(start.to_mut_ptr(), val, len);
        }
    }

    /// Reserve `size` bytes of address space aligned to `alignment`.
    /// The range is committed (readable/writable) iff `commit` is set.
    /// With `allow_large` the platform may back the range with large pages,
    /// which implies a pinned, committed result.
    fn reserve_aligned(
        size: usize,
        alignment: usize,
        commit: bool,
        allow_large: bool,
    ) -> Result<OsAllocation>;

    /// Reserve memory so that `(addr + align_offset)` is aligned to
    /// `alignment`. Over-reserves and returns an interior pointer; the
    /// whole reservation is recorded in the result for release.
    fn reserve_aligned_at_offset(
        size: usize,
        alignment: usize,
        align_offset: usize,
        commit: bool,
    ) -> Result<OsAllocation> {
        debug_assert!(alignment.is_power_of_two());
        if align_offset == 0 {
            return Self::reserve_aligned(size, alignment, commit, false);
        }
        if align_offset > alignment {
            return Err(std::io::Error::from_raw_os_error(libc::EINVAL));
        }
        let extra = raw_align_up(align_offset, alignment);
        let alloc = Self::reserve_aligned(size + extra, alignment, commit, false)?;
        Ok(OsAllocation {
            addr: alloc.base + (extra - align_offset),
            ..alloc
        })
    }

    /// Reserve `pages` 1 GiB huge pages, optionally bound to a NUMA node.
    /// Best effort: may return fewer pages than requested once
    /// `timeout_msecs` elapses (`<= 0` means no timeout). Fails only if no
    /// page at all could be obtained.
    fn alloc_huge_pages(
        pages: usize,
        numa_node: Option<u32>,
        timeout_msecs: i64,
    ) -> Result<OsAllocation>;

    /// Back a reserved range with physical memory. Returns whether the
    /// range is known to be zero-filled after the call.
    fn commit(start: Address, size: usize) -> Result<bool>;

    /// Return the physical memory behind a range to the OS, keeping the
    /// address range reserved. Accessing the range afterwards faults until
    /// it is committed again.
    fn decommit(start: Address, size: usize) -> Result<()>;

    /// Hint that the content of a committed range is no longer needed. The
    /// range stays committed and accessible; the OS may reclaim the pages
    /// at its leisure.
    fn reset(start: Address, size: usize) -> Result<()>;

    /// Make a range inaccessible (guard page maintenance).
    fn protect(start: Address, size: usize) -> Result<()>;

    /// Unmap a full reservation.
    fn release(start: Address, size: usize);

    /// The OS page size in bytes.
    fn page_size() -> usize;

    /// Does the OS overcommit memory (commit without reserving swap)?
    fn has_overcommit() -> bool;

    /// Can address space be reserved cheaply, without committing it?
    fn has_virtual_reserve() -> bool;

    /// Check whether the given OS error number indicates an out-of-memory
    /// condition.
    fn is_mmap_oom(os_errno: i32) -> bool {
        os_errno == libc::ENOMEM
    }

    /// Get the total memory of the system in bytes.
    fn get_system_total_memory() -> u64 {
        use sysinfo::MemoryRefreshKind;
        use sysinfo::{RefreshKind, System};

        // sysinfo recommends sharing one instance of `System`, but we only
        // query total memory once (for option defaults), and loading just
        // the RAM component keeps start-up fast.
        let sys = System::new_with_specifics(
            RefreshKind::nothing().with_memory(MemoryRefreshKind::nothing().with_ram()),
        );
        sys.total_memory()
    }
}

/// Process-level queries the placement policy and the purge scheduler need.
pub trait OsProcess {
    /// The NUMA node the calling thread currently runs on.
    fn current_numa_node() -> u32;

    /// The number of NUMA nodes on this machine (>= 1).
    fn numa_node_count() -> u32;

    /// A monotonic millisecond clock.
    fn now_msecs() -> i64 {
        lazy_static! {
            static ref EPOCH: Instant = Instant::now();
        }
        EPOCH.elapsed().as_millis() as i64
    }
}

/// The full OS binding the arena layer is generic over.
pub trait OperatingSystem: OsMemory + OsProcess + 'static + Send + Sync {}

// Reservation hint management. Clustering successive arena reservations
// keeps page tables dense and makes debugging output readable.
// 64-bit only; on 32-bit we let the OS choose freely.

#[cfg(target_pointer_width = "64")]
const HINT_BASE: usize = 2 << 40; // 2 TiB
#[cfg(target_pointer_width = "64")]
const HINT_AREA: usize = 4 << 40; // wrap after 4 TiB of hints

#[cfg(target_pointer_width = "64")]
static ALIGNED_HINT: Atomic<Address> = Atomic::new(Address::ZERO);

/// A hint address for the next large reservation, or None to let the OS
/// pick. The hint is advisory: callers pass it to a non-fixed mmap.
#[cfg(target_pointer_width = "32")]
pub(crate) fn aligned_hint(_size: usize) -> Option<Address> {
    None
}

/// A hint address for the next large reservation, or None to let the OS
/// pick. The hint is advisory: callers pass it to a non-fixed mmap.
#[cfg(target_pointer_width = "64")]
pub(crate) fn aligned_hint(size: usize) -> Option<Address> {
    if size > HINT_AREA / 4 {
        return None;
    }
    let size = raw_align_up(size, BYTES_IN_BLOCK);
    let mut current = ALIGNED_HINT.load(Ordering::Relaxed);
    loop {
        let start = if current.is_zero() || current.as_usize() + size > HINT_BASE + HINT_AREA {
            unsafe { Address::from_usize(HINT_BASE) }
        } else {
            current
        };
        match ALIGNED_HINT.compare_exchange_weak(
            current,
            start + size,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return Some(start),
            Err(v) => current = v,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hint_is_block_aligned_and_monotone() {
        let a = aligned_hint(BYTES_IN_BLOCK).unwrap();
        let b = aligned_hint(BYTES_IN_BLOCK).unwrap();
        assert!(a.is_aligned_to(BYTES_IN_BLOCK));
        assert!(b.is_aligned_to(BYTES_IN_BLOCK));
        assert_ne!(a, b);
    }

    #[test]
    fn clock_is_monotone() {
        let t0 = <Os as OsProcess>::now_msecs();
        let t1 = <Os as OsProcess>::now_msecs();
        assert!(t1 >= t0);
    }
}
