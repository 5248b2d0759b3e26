use std::io::Result;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::arena::memid::{ArenaId, MemId, MemKind};
use crate::arena::registry::ArenaRegistry;
use crate::arena::Arena;
use crate::util::constants::MAX_ARENAS;
use crate::util::conversions::blocks_to_bytes;
use crate::util::options::Options;
use crate::util::os::{OperatingSystem, OsMemory};
use crate::util::statistics::Stats;
use crate::util::Address;

/// An instance of the arena allocator.
///
/// The instance owns the arena registry, the options, and the statistics
/// counters. It has no threads of its own; every operation runs on the
/// calling thread. It is generic over the [`OperatingSystem`] binding so
/// tests can substitute a fake; production code uses
/// [`crate::util::os::Os`].
///
/// An instance is usually long lived (often `'static`): arenas reference
/// memory that outlives individual allocations, and dropping the instance
/// does not unmap them. Use [`VmArena::destroy_all`] on the shutdown path
/// if the address space must be returned eagerly.
pub struct VmArena<OS: OperatingSystem> {
    pub(crate) options: Options,
    pub(crate) registry: ArenaRegistry,
    pub(crate) stats: Stats,
    /// At most one thread walks the purge schedules at a time.
    pub(crate) purge_guard: AtomicBool,
    /// While set, fresh arena reservation and delayed purging are
    /// disabled; frees still release their blocks (purging immediately).
    bootstrapping: AtomicBool,
    _os: PhantomData<OS>,
}

impl<OS: OperatingSystem> VmArena<OS> {
    pub fn new(options: Options) -> Self {
        crate::util::logger::try_init();
        debug!(
            "creating arena allocator instance (arena_reserve = {} bytes, purge_delay = {} ms)",
            *options.arena_reserve, *options.purge_delay
        );
        VmArena {
            options,
            registry: ArenaRegistry::new(),
            stats: Stats::new(),
            purge_guard: AtomicBool::new(false),
            bootstrapping: AtomicBool::new(false),
            _os: PhantomData,
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn registry(&self) -> &ArenaRegistry {
        &self.registry
    }

    /// Mark the start or end of an embedder's bootstrap phase. While
    /// bootstrapping, no fresh arenas are reserved and purges run
    /// immediately instead of being scheduled.
    pub fn set_bootstrapping(&self, on: bool) {
        self.bootstrapping.store(on, Ordering::SeqCst);
    }

    pub fn is_bootstrapping(&self) -> bool {
        self.bootstrapping.load(Ordering::SeqCst)
    }

    /// The effective purge delay in ms. Negative disables purging, zero
    /// purges synchronously at free time.
    pub(crate) fn purge_delay(&self) -> i64 {
        (*self.options.purge_delay).saturating_mul(*self.options.arena_purge_mult as i64)
    }

    /// Commit a range through the OS binding, with statistics.
    pub(crate) fn os_commit(&self, start: Address, size: usize) -> Result<bool> {
        let zeroed = OS::commit(start, size)?;
        self.stats.committed.increase(size);
        Ok(zeroed)
    }

    /// Purge a range: return its physical memory to the OS while keeping
    /// the reservation. Returns whether the pages must be committed again
    /// before use (i.e. they were decommitted rather than reset).
    pub(crate) fn os_purge(&self, start: Address, size: usize, allow_reset: bool) -> bool {
        self.stats.purged.increase(size);
        if *self.options.purge_decommits || !allow_reset {
            if let Err(e) = OS::decommit(start, size) {
                warn!("decommit of {} bytes at {} failed: {}", size, start, e);
            }
            self.stats.committed.decrease(size);
            true
        } else {
            if let Err(e) = OS::reset(start, size) {
                warn!("reset of {} bytes at {} failed: {}", size, start, e);
            }
            false
        }
    }

    /// Initialize an arena over `[start, start + size)` and publish it.
    /// On a full registry the range is released (if OS-owned) and ENOMEM
    /// is returned.
    pub(crate) fn add_arena(
        &self,
        start: Address,
        size: usize,
        memid: MemId,
        numa_node: Option<u32>,
        exclusive: bool,
        is_large: bool,
    ) -> Result<ArenaId> {
        let meta_bytes = blocks_to_bytes(Arena::metadata_blocks());
        let arena = match unsafe {
            Arena::initialize::<OS>(start, size, memid, numa_node, exclusive, is_large)
        } {
            Ok(arena) => arena,
            Err(e) => {
                // OS-owned ranges must not leak on a failed registration
                if let MemKind::Os { base, size: full } = memid.kind() {
                    OS::release(base, full);
                    self.stats.reserved.decrease(full);
                    if memid.initially_committed() {
                        self.stats.committed.decrease(full);
                    }
                }
                return Err(e);
            }
        };
        if !memid.initially_committed() {
            self.stats.committed.increase(meta_bytes);
        }
        match unsafe { self.registry.add(arena) } {
            Ok(id) => {
                self.stats.arenas_created.inc();
                debug!(
                    "registered arena {}: {} blocks at {}{}{}",
                    id,
                    unsafe { (*arena).block_count },
                    start,
                    if exclusive { ", exclusive" } else { "" },
                    if is_large { ", large pages" } else { "" },
                );
                Ok(id)
            }
            Err(()) => {
                warn!(
                    "cannot register arena at {}: all {} registry slots are in use",
                    start, MAX_ARENAS
                );
                if !memid.initially_committed() {
                    self.stats.committed.decrease(meta_bytes);
                }
                if let MemKind::Os { base, size: full } = memid.kind() {
                    OS::release(base, full);
                    self.stats.reserved.decrease(full);
                    if memid.initially_committed() {
                        self.stats.committed.decrease(full);
                    }
                }
                Err(std::io::Error::from_raw_os_error(libc::ENOMEM))
            }
        }
    }

    /// Tear down all arenas and return OS-owned ranges to the OS.
    ///
    /// # Safety
    /// No memory obtained from this instance may still be in use, and no
    /// other thread may be calling into the instance. This is the process
    /// shutdown path.
    pub unsafe fn destroy_all(&self) {
        self.registry.destroy_all::<OS>();
    }
}

impl<OS: OperatingSystem> Default for VmArena<OS> {
    fn default() -> Self {
        let mut options = Options::default();
        options.read_env_var_settings();
        Self::new(options)
    }
}
