//! Allocation tracing support.
//!
//! When the `tracing` feature is enabled, this module emits structured
//! events for the slow paths of the allocator and spans for stop-the-world
//! collections. Without the feature every helper compiles to nothing.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing::{span, Level};

    use crate::alloc::{Address, AllocationOrigin};

    /// Identifier correlating every event of one safepoint-driven collection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CollectionId(pub u64);

    static NEXT_COLLECTION_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate the next collection id.
    pub fn next_collection_id() -> CollectionId {
        CollectionId(NEXT_COLLECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Span covering a whole stop-the-world collection.
    pub fn trace_collection(id: CollectionId, threads: usize) -> span::EnteredSpan {
        span!(Level::DEBUG, "collection", collection_id = id.0, threads).entered()
    }

    pub fn log_slice_granted(thread: usize, start: Address, size: usize, origin: AllocationOrigin) {
        tracing::trace!(thread, start, size, origin = ?origin, "slice_granted");
    }

    pub fn log_space_exhausted(thread: usize, min_size: usize, origin: AllocationOrigin) {
        tracing::debug!(thread, min_size, origin = ?origin, "space_exhausted");
    }

    pub fn log_lab_refill(thread: usize, start: Address, size: usize, merged: bool) {
        tracing::debug!(thread, start, size, merged, "lab_refill");
    }

    pub fn log_lab_retired(thread: usize, top: Address, free_bytes: usize) {
        tracing::debug!(thread, top, free_bytes, "lab_retired");
    }

    pub fn log_outside_lab(thread: usize, address: Address, size: usize) {
        tracing::debug!(thread, address, size, "outside_lab_allocation");
    }

    pub fn log_black_allocation(active: bool) {
        tracing::debug!(active, "black_allocation");
    }

    pub fn log_collection_retry(thread: usize, attempt: usize) {
        tracing::debug!(thread, attempt, "collection_retry");
    }

    pub fn log_collection_done(id: CollectionId, pause_micros: u64) {
        tracing::debug!(collection_id = id.0, pause_micros, "collection_done");
    }

    pub fn log_sweep(reclaimed: usize) {
        tracing::debug!(reclaimed, "sweep");
    }

    pub fn log_fatal_oom(location: &str) {
        tracing::error!(location, "fatal out of memory");
    }

    pub fn log_stress_round(iterations: usize, allocations: usize) {
        tracing::debug!(iterations, allocations, "stress_round");
    }
}

#[cfg(not(feature = "tracing"))]
#[allow(clippy::missing_const_for_fn)]
pub mod internal {
    use crate::alloc::{Address, AllocationOrigin};

    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CollectionId(pub u64);

    pub fn next_collection_id() -> CollectionId {
        CollectionId(0)
    }

    pub fn trace_collection(_id: CollectionId, _threads: usize) {}

    pub fn log_slice_granted(_: usize, _: Address, _: usize, _: AllocationOrigin) {}

    pub fn log_space_exhausted(_: usize, _: usize, _: AllocationOrigin) {}

    pub fn log_lab_refill(_: usize, _: Address, _: usize, _: bool) {}

    pub fn log_lab_retired(_: usize, _: Address, _: usize) {}

    pub fn log_outside_lab(_: usize, _: Address, _: usize) {}

    pub fn log_black_allocation(_: bool) {}

    pub fn log_collection_retry(_: usize, _: usize) {}

    pub fn log_collection_done(_: CollectionId, _: u64) {}

    pub fn log_sweep(_: usize) {}

    pub fn log_fatal_oom(_: &str) {}

    pub fn log_stress_round(_: usize, _: usize) {}
}
