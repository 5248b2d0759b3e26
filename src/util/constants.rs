//! Design constants for the arena layer.

use static_assertions::const_assert;

/// log2 of the number of bits in a byte
pub const LOG_BITS_IN_BYTE: u8 = 3;
/// The number of bits in a byte
pub const BITS_IN_BYTE: usize = 1 << LOG_BITS_IN_BYTE;

/// log2 of the number of bytes in a kilobyte
pub const LOG_BYTES_IN_KBYTE: u8 = 10;
/// The number of bytes in a kilobyte
pub const BYTES_IN_KBYTE: usize = 1 << LOG_BYTES_IN_KBYTE;

/// log2 of the number of bytes in a megabyte
pub const LOG_BYTES_IN_MBYTE: u8 = 20;
/// The number of bytes in a megabyte
pub const BYTES_IN_MBYTE: usize = 1 << LOG_BYTES_IN_MBYTE;

/// log2 of the number of bytes in a gigabyte
pub const LOG_BYTES_IN_GBYTE: u8 = 30;
/// The number of bytes in a gigabyte
pub const BYTES_IN_GBYTE: usize = 1 << LOG_BYTES_IN_GBYTE;

#[cfg(target_pointer_width = "32")]
/// log2 of the number of bytes in an address
pub const LOG_BYTES_IN_ADDRESS: u8 = 2;
#[cfg(target_pointer_width = "64")]
/// log2 of the number of bytes in an address
pub const LOG_BYTES_IN_ADDRESS: u8 = 3;
/// The number of bytes in an address
pub const BYTES_IN_ADDRESS: usize = 1 << LOG_BYTES_IN_ADDRESS;

/// log2 of the number of bytes in a word
pub const LOG_BYTES_IN_WORD: u8 = LOG_BYTES_IN_ADDRESS;
/// The number of bytes in a word
pub const BYTES_IN_WORD: usize = 1 << LOG_BYTES_IN_WORD;
/// log2 of the number of bits in a word
pub const LOG_BITS_IN_WORD: usize = LOG_BITS_IN_BYTE as usize + LOG_BYTES_IN_WORD as usize;
/// The number of bits in a word
pub const BITS_IN_WORD: usize = 1 << LOG_BITS_IN_WORD;

/// log2 of the number of bytes in a page
pub const LOG_BYTES_IN_PAGE: u8 = 12;
/// The number of bytes in a page
pub const BYTES_IN_PAGE: usize = 1 << LOG_BYTES_IN_PAGE;

/// log2 of the number of bytes in an arena block, the granule at which
/// arenas hand out memory.
pub const LOG_BYTES_IN_BLOCK: u8 = 22;
/// The number of bytes in an arena block (4 MiB).
pub const BYTES_IN_BLOCK: usize = 1 << LOG_BYTES_IN_BLOCK;
/// Arena blocks are aligned to their own size.
pub const BLOCK_ALIGN: usize = BYTES_IN_BLOCK;

/// The capacity of the arena registry. Arena ids are one-based indices
/// into the registry, so valid ids are `1..=MAX_ARENAS`.
pub const MAX_ARENAS: usize = 1024;

/// The number of abandoned-block bins reserved in every arena descriptor.
/// The abandoned-visit protocol itself lives outside this crate; the bins
/// are declared and zero-initialized so the descriptor layout is stable.
pub const BIN_COUNT: usize = 32;

/// The smallest request the arena layer serves itself. Anything smaller
/// would waste most of a block and is delegated to the OS.
pub const MIN_OBJ_SIZE: usize = BYTES_IN_BLOCK / 2;
/// The largest request the arena layer serves itself (256 blocks).
pub const MAX_OBJ_SIZE: usize = 256 * BYTES_IN_BLOCK;

const_assert!(BYTES_IN_BLOCK.is_power_of_two());
const_assert!(BYTES_IN_BLOCK % BYTES_IN_PAGE == 0);
const_assert!(MIN_OBJ_SIZE <= MAX_OBJ_SIZE);
const_assert!(MAX_OBJ_SIZE % BYTES_IN_BLOCK == 0);
