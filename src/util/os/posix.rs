//! Shared POSIX plumbing for the platform bindings.

use std::io::Result;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::util::Address;

pub fn wrap_libc_call<T: PartialEq>(f: &dyn Fn() -> T, expect: T) -> Result<()> {
    let ret = f();
    if ret == expect {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Raw mmap. `hint` is advisory (no `MAP_FIXED`); pass `Address::ZERO` to
/// let the kernel choose.
pub fn mmap(hint: Address, size: usize, prot: i32, flags: i32) -> Result<Address> {
    let res = unsafe { libc::mmap(hint.to_mut_ptr(), size, prot, flags, -1, 0) };
    if res == libc::MAP_FAILED {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(Address::from_mut_ptr(res))
    }
}

pub fn munmap(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(&|| unsafe { libc::munmap(start.to_mut_ptr(), size) }, 0)
}

pub fn mprotect(start: Address, size: usize, prot: i32) -> Result<()> {
    wrap_libc_call(&|| unsafe { libc::mprotect(start.to_mut_ptr(), size, prot) }, 0)
}

pub fn madvise(start: Address, size: usize, advice: i32) -> Result<()> {
    wrap_libc_call(
        &|| unsafe { libc::madvise(start.to_mut_ptr(), size, advice) },
        0,
    )
}

pub fn prot_for(commit: bool) -> i32 {
    if commit {
        libc::PROT_READ | libc::PROT_WRITE
    } else {
        libc::PROT_NONE
    }
}

/// Reserve `size` bytes aligned to `alignment`. A hinted mmap usually gives
/// an aligned result in one call; otherwise retry with headroom and trim
/// the slack off both ends.
pub fn reserve_aligned(
    size: usize,
    alignment: usize,
    commit: bool,
    extra_flags: i32,
) -> Result<Address> {
    debug_assert!(alignment.is_power_of_two());
    debug_assert!(size % page_size() == 0);
    let prot = prot_for(commit);
    let flags = libc::MAP_PRIVATE | libc::MAP_ANON | extra_flags;
    let hint = super::aligned_hint(size).unwrap_or(Address::ZERO);
    let p = mmap(hint, size, prot, flags)?;
    if p.is_aligned_to(alignment) {
        return Ok(p);
    }
    trace!(
        "unaligned reservation at {}, retrying with {} bytes of headroom",
        p,
        alignment
    );
    let _ = munmap(p, size);
    let over = size + alignment;
    let p = mmap(Address::ZERO, over, prot, flags)?;
    let aligned = p.align_up(alignment);
    let lead = aligned - p;
    if lead > 0 {
        let _ = munmap(p, lead);
    }
    let trail = over - lead - size;
    if trail > 0 {
        let _ = munmap(aligned + size, trail);
    }
    Ok(aligned)
}

/// Back a reserved range with physical memory.
pub fn commit(start: Address, size: usize) -> Result<bool> {
    mprotect(start, size, libc::PROT_READ | libc::PROT_WRITE)?;
    // the pages may retain earlier content (e.g. after a reset)
    Ok(false)
}

/// Give the physical memory back and fault on any further access.
pub fn decommit(start: Address, size: usize) -> Result<()> {
    madvise(start, size, libc::MADV_DONTNEED)?;
    mprotect(start, size, libc::PROT_NONE)
}

// `MADV_FREE` is cheaper than `MADV_DONTNEED` but not available on every
// kernel; on the first EINVAL we switch the advice for the whole process.
static RESET_ADVICE: AtomicI32 = AtomicI32::new(libc::MADV_FREE);

/// Hint that the content of a committed range is disposable.
pub fn reset(start: Address, size: usize) -> Result<()> {
    let advice = RESET_ADVICE.load(Ordering::Relaxed);
    match madvise(start, size, advice) {
        Err(e)
            if e.raw_os_error() == Some(libc::EINVAL) && advice == libc::MADV_FREE =>
        {
            RESET_ADVICE.store(libc::MADV_DONTNEED, Ordering::Relaxed);
            madvise(start, size, libc::MADV_DONTNEED)
        }
        other => other,
    }
}

pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
