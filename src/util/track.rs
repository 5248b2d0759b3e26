//! Annotation points for external memory checkers.
//!
//! These hooks mark ranges as undefined, defined, or inaccessible at the
//! points where ownership changes hands. They compile to nothing here; a
//! downstream build can route them to valgrind/ASan client requests.

use crate::util::Address;

/// The range holds memory whose content must not be read before writing.
#[inline(always)]
pub fn mem_undefined(_start: Address, _len: usize) {}

/// The range holds initialized memory.
#[inline(always)]
pub fn mem_defined(_start: Address, _len: usize) {}

/// The range must not be accessed at all (decommitted or freed).
#[inline(always)]
pub fn mem_noaccess(_start: Address, _len: usize) {}
