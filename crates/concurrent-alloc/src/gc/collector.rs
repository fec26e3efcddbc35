//! The collector invoked at a safepoint.

use crate::heap::Heap;

/// Runs one full collection while every other thread is parked.
pub trait GarbageCollector: Send + Sync {
    fn collect_garbage(&self, heap: &Heap);
}

/// Default collector for heaps without an object model.
///
/// Ends incremental marking as a completed cycle would, closes every LAB and
/// sweeps: memory covered by fillers that are not marked black goes back to
/// the space. Allocations hold a filler until their owner overwrites or
/// marks them, so unclaimed allocations are reclaimed too.
#[derive(Debug, Clone, Copy, Default)]
pub struct SweepingCollector;

impl GarbageCollector for SweepingCollector {
    fn collect_garbage(&self, heap: &Heap) {
        heap.marking().finish_black_allocation();
        heap.sweep();
    }
}
