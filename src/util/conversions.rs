use crate::util::constants::*;
use crate::util::Address;

/// Align up an address to the arena block size.
pub fn block_align_up(addr: Address) -> Address {
    addr.align_up(BYTES_IN_BLOCK)
}

/// Align down an address to the arena block size.
pub fn block_align_down(addr: Address) -> Address {
    addr.align_down(BYTES_IN_BLOCK)
}

/// Is the address aligned to the arena block size?
pub fn is_block_aligned(addr: Address) -> bool {
    addr.is_aligned_to(BYTES_IN_BLOCK)
}

/// Convert a block count to bytes.
pub fn blocks_to_bytes(blocks: usize) -> usize {
    blocks << LOG_BYTES_IN_BLOCK
}

/// Convert bytes to a block count, rounding up.
pub fn bytes_to_blocks_up(bytes: usize) -> usize {
    (bytes + BYTES_IN_BLOCK - 1) >> LOG_BYTES_IN_BLOCK
}

/// Convert a page count to bytes.
pub fn pages_to_bytes(pages: usize) -> usize {
    pages << LOG_BYTES_IN_PAGE
}

// const versions of the alignment helpers, so they can be used by
// `Address` and in constant declarations.

pub const fn raw_align_up(val: usize, align: usize) -> usize {
    // See https://github.com/rust-lang/rust/blob/master/src/libcore/alloc.rs#L192
    val.wrapping_add(align).wrapping_sub(1) & !align.wrapping_sub(1)
}

pub const fn raw_align_down(val: usize, align: usize) -> usize {
    val & !align.wrapping_sub(1)
}

pub const fn raw_is_aligned(val: usize, align: usize) -> bool {
    val & align.wrapping_sub(1) == 0
}
