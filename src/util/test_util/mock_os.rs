//! A counting, partially fake OS binding for unit tests.
//!
//! Memory operations delegate to the real platform binding (the tests do
//! exercise actual mappings), but every call is counted, and the NUMA
//! topology and the clock are test-controlled. State is process-global, so
//! tests using `MockOs` must run under [`super::serial_test`].

use std::io::Result;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};

use crate::util::os::{OperatingSystem, Os, OsAllocation, OsMemory, OsProcess};
use crate::util::Address;

static COMMIT_CALLS: AtomicUsize = AtomicUsize::new(0);
static DECOMMIT_CALLS: AtomicUsize = AtomicUsize::new(0);
static RESET_CALLS: AtomicUsize = AtomicUsize::new(0);
static CURRENT_NUMA: AtomicU32 = AtomicU32::new(0);
static NUMA_COUNT: AtomicU32 = AtomicU32::new(1);
static CLOCK_MSECS: AtomicI64 = AtomicI64::new(0);
static OVERCOMMIT: AtomicBool = AtomicBool::new(true);

pub struct MockOs;

impl MockOs {
    /// Reset all mock state. Call at the start of every `MockOs` test.
    pub fn reset() {
        COMMIT_CALLS.store(0, Ordering::SeqCst);
        DECOMMIT_CALLS.store(0, Ordering::SeqCst);
        RESET_CALLS.store(0, Ordering::SeqCst);
        CURRENT_NUMA.store(0, Ordering::SeqCst);
        NUMA_COUNT.store(1, Ordering::SeqCst);
        CLOCK_MSECS.store(0, Ordering::SeqCst);
        OVERCOMMIT.store(true, Ordering::SeqCst);
    }

    pub fn commit_calls() -> usize {
        COMMIT_CALLS.load(Ordering::SeqCst)
    }

    pub fn decommit_calls() -> usize {
        DECOMMIT_CALLS.load(Ordering::SeqCst)
    }

    pub fn reset_calls() -> usize {
        RESET_CALLS.load(Ordering::SeqCst)
    }

    pub fn set_numa(current: u32, count: u32) {
        CURRENT_NUMA.store(current, Ordering::SeqCst);
        NUMA_COUNT.store(count, Ordering::SeqCst);
    }

    pub fn advance_clock(msecs: i64) {
        CLOCK_MSECS.fetch_add(msecs, Ordering::SeqCst);
    }

    pub fn set_overcommit(on: bool) {
        OVERCOMMIT.store(on, Ordering::SeqCst);
    }
}

impl OsMemory for MockOs {
    fn reserve_aligned(
        size: usize,
        alignment: usize,
        commit: bool,
        allow_large: bool,
    ) -> Result<OsAllocation> {
        Os::reserve_aligned(size, alignment, commit, allow_large)
    }

    fn alloc_huge_pages(
        pages: usize,
        numa_node: Option<u32>,
        timeout_msecs: i64,
    ) -> Result<OsAllocation> {
        Os::alloc_huge_pages(pages, numa_node, timeout_msecs)
    }

    fn commit(start: Address, size: usize) -> Result<bool> {
        COMMIT_CALLS.fetch_add(1, Ordering::SeqCst);
        Os::commit(start, size)
    }

    fn decommit(start: Address, size: usize) -> Result<()> {
        DECOMMIT_CALLS.fetch_add(1, Ordering::SeqCst);
        Os::decommit(start, size)
    }

    fn reset(start: Address, size: usize) -> Result<()> {
        RESET_CALLS.fetch_add(1, Ordering::SeqCst);
        Os::reset(start, size)
    }

    fn protect(start: Address, size: usize) -> Result<()> {
        Os::protect(start, size)
    }

    fn release(start: Address, size: usize) {
        Os::release(start, size)
    }

    fn page_size() -> usize {
        Os::page_size()
    }

    fn has_overcommit() -> bool {
        OVERCOMMIT.load(Ordering::SeqCst)
    }

    fn has_virtual_reserve() -> bool {
        true
    }
}

impl OsProcess for MockOs {
    fn current_numa_node() -> u32 {
        CURRENT_NUMA.load(Ordering::SeqCst)
    }

    fn numa_node_count() -> u32 {
        NUMA_COUNT.load(Ordering::SeqCst)
    }

    fn now_msecs() -> i64 {
        CLOCK_MSECS.load(Ordering::SeqCst)
    }
}

impl OperatingSystem for MockOs {}
