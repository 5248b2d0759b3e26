//! Allocator-wide statistics counters.

pub mod counter;

pub use self::counter::{EventCounter, SizeCounter};

/// The counters one allocator instance maintains. All counters are cheap
/// atomics; they are updated on OS-interaction paths only, never on the
/// bitmap fast path.
pub struct Stats {
    /// Bytes of memory currently committed (backed by physical memory).
    pub committed: SizeCounter,
    /// Bytes of address space currently reserved.
    pub reserved: SizeCounter,
    /// Bytes handed to the OS purge machinery so far.
    pub purged: SizeCounter,
    /// Number of arenas ever registered.
    pub arenas_created: EventCounter,
}

impl Stats {
    pub fn new() -> Self {
        Stats {
            committed: SizeCounter::new(),
            reserved: SizeCounter::new(),
            purged: SizeCounter::new(),
            arenas_created: EventCounter::new(),
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}
