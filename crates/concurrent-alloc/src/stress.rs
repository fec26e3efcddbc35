//! Self-rescheduling background task that hammers the concurrent allocator.
//!
//! Each run registers a fresh [`LocalHeap`] on a worker thread, performs
//! [`STRESS_ITERATIONS`] rounds of one small in-LAB allocation and one
//! medium allocation that bypasses the LAB, polls the safepoint every few
//! rounds, then schedules itself again unless the heap is tearing down.

use std::sync::Arc;

use crate::alloc::{Address, AllocationAlignment, AllocationOrigin};
use crate::error::HeapError;
use crate::heap::filler::create_filler_object_at;
use crate::heap::{Heap, KB, WORD_SIZE};
use crate::local_heap::LocalHeap;
use crate::platform::{Platform, Task};

pub const STRESS_ITERATIONS: usize = 2000;
pub const SMALL_OBJECT_SIZE: usize = 10 * WORD_SIZE;
pub const MEDIUM_OBJECT_SIZE: usize = 8 * KB;

/// What one run of the task did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StressReport {
    pub iterations: usize,
    pub allocations: usize,
    pub bytes_allocated: usize,
    pub safepoints: usize,
}

pub struct StressConcurrentAllocatorTask {
    heap: Arc<Heap>,
    platform: Arc<dyn Platform>,
}

impl StressConcurrentAllocatorTask {
    #[must_use]
    pub fn new(heap: Arc<Heap>, platform: Arc<dyn Platform>) -> Self {
        Self { heap, platform }
    }

    /// Post the first run after the configured delay.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::StressDisabled`] unless the heap was configured
    /// with `stress_concurrent_allocation`.
    pub fn schedule(heap: &Arc<Heap>, platform: &Arc<dyn Platform>) -> Result<(), HeapError> {
        if !heap.config().stress_concurrent_allocation {
            return Err(HeapError::StressDisabled);
        }
        let task = Box::new(Self::new(Arc::clone(heap), Arc::clone(platform)));
        platform.call_delayed_on_worker_thread(task, heap.config().stress_delay);
        Ok(())
    }

    /// One full round of allocations on the calling thread.
    pub fn run_internal(&self) -> StressReport {
        self.run_internal_with(|_, _| {})
    }

    /// Like [`Self::run_internal`], passing every allocation's address and
    /// size to `on_allocation`.
    pub fn run_internal_with(&self, mut on_allocation: impl FnMut(Address, usize)) -> StressReport {
        let mut local = LocalHeap::new(&self.heap);
        let interval = self.heap.config().stress_safepoint_interval;
        let mut report = StressReport::default();

        for i in 0..STRESS_ITERATIONS {
            for size in [SMALL_OBJECT_SIZE, MEDIUM_OBJECT_SIZE] {
                let address = local.old_space_allocator().allocate_or_fail(
                    size,
                    AllocationAlignment::Word,
                    AllocationOrigin::Runtime,
                );
                // SAFETY: the allocator just handed this range to us.
                unsafe { create_filler_object_at(address, size) };
                on_allocation(address, size);
                report.allocations += 1;
                report.bytes_allocated += size;
            }

            if i % interval == 0 {
                local.safepoint();
                report.safepoints += 1;
            }
            report.iterations += 1;
        }

        crate::tracing::internal::log_stress_round(report.iterations, report.allocations);
        report
    }
}

impl Task for StressConcurrentAllocatorTask {
    fn run(self: Box<Self>) {
        self.run_internal();
        if self.heap.is_tearing_down() {
            return;
        }
        let platform = Arc::clone(&self.platform);
        let delay = self.heap.config().stress_delay;
        platform.call_delayed_on_worker_thread(self, delay);
    }
}

impl std::fmt::Debug for StressConcurrentAllocatorTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StressConcurrentAllocatorTask")
            .field("heap", &self.heap)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::HeapConfig;

    struct Discard;

    impl Platform for Discard {
        fn call_on_worker_thread(&self, _task: Box<dyn Task>) {}

        fn call_delayed_on_worker_thread(&self, _task: Box<dyn Task>, _delay: Duration) {}
    }

    fn out_of_memory(location: &str) -> ! {
        panic!("out of memory: {location}")
    }

    #[test]
    fn test_rounds_outlast_default_reservation() {
        let config = HeapConfig {
            stress_concurrent_allocation: true,
            ..HeapConfig::default()
        };
        let capacity = config.reservation_size;
        let heap = Heap::builder(config)
            .on_out_of_memory(out_of_memory)
            .build()
            .unwrap();
        let task = StressConcurrentAllocatorTask::new(Arc::clone(&heap), Arc::new(Discard));

        let mut allocated = 0;
        for _ in 0..6 {
            let report = task.run_internal();
            assert_eq!(report.iterations, STRESS_ITERATIONS);
            allocated += report.bytes_allocated;
        }

        assert!(allocated > capacity);
        let snapshot = heap.metrics().snapshot();
        assert!(snapshot.collections >= 1);
        assert!(snapshot.bytes_reclaimed > 0);
    }
}
