//! Allocation metrics and statistics.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crate::alloc::AllocationOrigin;

/// Counters kept by one [`ConcurrentAllocator`](crate::ConcurrentAllocator).
///
/// Owned by a single thread, so plain integers suffice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Slices obtained to replenish the LAB.
    pub lab_refills: usize,
    /// Refills merged into the previous LAB.
    pub lab_merges: usize,
    /// LABs closed with free space left over.
    pub lab_retirements: usize,
    /// Objects allocated directly from the shared space.
    pub outside_lab_allocations: usize,
    /// Collections requested by the retry protocol.
    pub collection_retries: usize,
    /// Bytes handed to callers, indexed by [`AllocationOrigin::index`].
    pub bytes_by_origin: [usize; AllocationOrigin::COUNT],
}

impl AllocatorStats {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            lab_refills: 0,
            lab_merges: 0,
            lab_retirements: 0,
            outside_lab_allocations: 0,
            collection_retries: 0,
            bytes_by_origin: [0; AllocationOrigin::COUNT],
        }
    }

    /// Total bytes handed out across every origin.
    #[must_use]
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_by_origin.iter().sum()
    }

    pub(crate) fn record_allocation(&mut self, origin: AllocationOrigin, size: usize) {
        self.bytes_by_origin[origin.index()] += size;
    }
}

/// Heap-wide counters, shared by every thread.
#[derive(Debug, Default)]
pub struct HeapMetrics {
    lab_refills: AtomicUsize,
    lab_merges: AtomicUsize,
    lab_retirements: AtomicUsize,
    outside_lab_allocations: AtomicUsize,
    collection_retries: AtomicUsize,
    bytes_allocated: AtomicUsize,
    collection_requests: AtomicUsize,
    collections: AtomicUsize,
    bytes_reclaimed: AtomicUsize,
    last_pause_ns: AtomicU64,
}

/// Plain copy of [`HeapMetrics`] at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapMetricsSnapshot {
    pub lab_refills: usize,
    pub lab_merges: usize,
    pub lab_retirements: usize,
    pub outside_lab_allocations: usize,
    pub collection_retries: usize,
    /// Bytes allocated by local heaps that have been dropped.
    pub bytes_allocated: usize,
    /// Calls to `request_and_wait_for_collection`.
    pub collection_requests: usize,
    /// Collector runs; lower than requests when requests coalesce.
    pub collections: usize,
    /// Bytes returned to the space by sweeps.
    pub bytes_reclaimed: usize,
    /// Duration of the most recent stop-the-world pause.
    pub last_pause: Duration,
}

impl HeapMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a finished allocator's statistics into the heap totals.
    pub fn absorb(&self, stats: &AllocatorStats) {
        self.lab_refills.fetch_add(stats.lab_refills, Ordering::Relaxed);
        self.lab_merges.fetch_add(stats.lab_merges, Ordering::Relaxed);
        self.lab_retirements
            .fetch_add(stats.lab_retirements, Ordering::Relaxed);
        self.outside_lab_allocations
            .fetch_add(stats.outside_lab_allocations, Ordering::Relaxed);
        self.collection_retries
            .fetch_add(stats.collection_retries, Ordering::Relaxed);
        self.bytes_allocated
            .fetch_add(stats.bytes_allocated(), Ordering::Relaxed);
    }

    pub(crate) fn record_collection_request(&self) {
        self.collection_requests.fetch_add(1, Ordering::Relaxed);
    }

    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn record_collection(&self, pause: Duration) {
        self.collections.fetch_add(1, Ordering::Relaxed);
        self.last_pause_ns
            .store(pause.as_nanos() as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_sweep(&self, reclaimed: usize) {
        self.bytes_reclaimed.fetch_add(reclaimed, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> HeapMetricsSnapshot {
        HeapMetricsSnapshot {
            lab_refills: self.lab_refills.load(Ordering::Relaxed),
            lab_merges: self.lab_merges.load(Ordering::Relaxed),
            lab_retirements: self.lab_retirements.load(Ordering::Relaxed),
            outside_lab_allocations: self.outside_lab_allocations.load(Ordering::Relaxed),
            collection_retries: self.collection_retries.load(Ordering::Relaxed),
            bytes_allocated: self.bytes_allocated.load(Ordering::Relaxed),
            collection_requests: self.collection_requests.load(Ordering::Relaxed),
            collections: self.collections.load(Ordering::Relaxed),
            bytes_reclaimed: self.bytes_reclaimed.load(Ordering::Relaxed),
            last_pause: Duration::from_nanos(self.last_pause_ns.load(Ordering::Relaxed)),
        }
    }
}
