//! vmarena is a thread-safe arena allocator that hands out large aligned
//! block ranges carved from pre-reserved OS address ranges. It is the
//! coarse-grained substrate underneath a finer-grained general-purpose
//! allocator: upstream code asks for multi-megabyte aligned chunks, the
//! arena layer claims them from shared atomic bitmaps (no per-thread
//! caches), and tracks commit state and lazy purging so that physical
//! memory use follows actual residency rather than reserved virtual size.
//!
//! Logically, this crate includes these major parts:
//! * [Arenas](arena/index.html): block-aligned OS reservations with
//!   self-hosted descriptors and four bitmaps tracking the free /
//!   committed / dirty / scheduled-for-purge state of every block.
//! * [The bitmap](arena/bitmap/struct.Bitmap.html): a fixed-capacity
//!   chunked atomic bitmap whose claim operations serialize allocation,
//!   freeing, and purging without any lock.
//! * [The instance](struct.VmArena.html): the registry of arenas plus the
//!   placement policy (requested arena, NUMA affinity, large-page
//!   eligibility), eager reservation of fresh arenas, and the lazy purge
//!   scheduler.
//! * [The public API](memory_manager/index.html): adopt or reserve OS
//!   memory (including 1 GiB huge pages), allocate and free block ranges,
//!   run purge passes, and inspect arenas.
//! * [The OS facade](util/os/index.html): the narrow trait the arena
//!   layer consumes; production code uses the platform binding, tests may
//!   substitute their own.

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;

pub mod arena;
pub mod memory_manager;
pub mod util;
mod vmarena;

pub use crate::arena::inspect::ArenaSnapshot;
pub use crate::arena::memid::{ArenaId, MemId, MemKind};
pub use crate::vmarena::VmArena;
