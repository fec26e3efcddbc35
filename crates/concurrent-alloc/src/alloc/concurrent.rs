//! Per-thread allocator over the shared old space.
//!
//! The fast path bumps inside the thread's LAB. Misses refill the LAB from
//! the shared space (merging with the old one when adjacent), large objects
//! get their own slice, and when the space is exhausted
//! [`ConcurrentAllocator::allocate_or_fail`] parks the thread, asks for a
//! collection and tries again a bounded number of times.

use std::sync::Arc;

use crate::alloc::{
    Address, AllocationAlignment, AllocationOrigin, AllocationResult, LinearAllocationBuffer,
    RetryReason,
};
use crate::gc::ParkedScope;
use crate::heap::filler::create_filler_object_at;
use crate::heap::{Heap, MAX_REGULAR_OBJECT_SIZE, WORD_SIZE};
use crate::local_heap::ThreadState;
use crate::metrics::AllocatorStats;

/// Collections requested before an allocation failure becomes fatal.
pub const MAX_COLLECTION_ATTEMPTS: usize = 3;

/// Handle to the calling thread's allocation state.
///
/// The LAB itself lives in the thread's [`ThreadState`] so that a collector
/// can close or blacken it while the thread is parked.
pub struct ConcurrentAllocator {
    heap: Arc<Heap>,
    thread: Arc<ThreadState>,
}

impl ConcurrentAllocator {
    pub(crate) fn new(heap: Arc<Heap>, thread: Arc<ThreadState>) -> Self {
        Self { heap, thread }
    }

    fn with_state<R>(&mut self, f: impl FnOnce(&mut AllocatorState, &Heap, &ThreadState) -> R) -> R {
        let (heap, thread) = (&*self.heap, &*self.thread);
        // SAFETY: `&mut self` is only reachable through the owning
        // `LocalHeap`, which cannot be parked while it is borrowed mutably.
        unsafe { thread.with_allocator_state(|state| f(state, heap, thread)) }
    }

    fn state(&self) -> &AllocatorState {
        // SAFETY: as in `with_state`; a shared borrow of the allocator also
        // keeps the owner from parking.
        unsafe { self.thread.allocator_state() }
    }

    #[must_use]
    pub fn lab(&self) -> &LinearAllocationBuffer {
        &self.state().lab
    }

    #[must_use]
    pub fn stats(&self) -> &AllocatorStats {
        &self.state().stats
    }

    #[must_use]
    pub fn thread_id(&self) -> usize {
        self.thread.id()
    }

    /// Allocate `size` bytes without ever requesting a collection.
    ///
    /// `size` must be a non-zero word multiple no larger than
    /// [`MAX_REGULAR_OBJECT_SIZE`]. The returned range holds a filler until
    /// the caller overwrites it. When black allocation is active the range
    /// is already marked black.
    pub fn allocate(
        &mut self,
        size: usize,
        alignment: AllocationAlignment,
        origin: AllocationOrigin,
    ) -> AllocationResult {
        debug_assert!(size > 0, "zero-sized allocation");
        debug_assert_eq!(size % WORD_SIZE, 0, "allocation size {size} is not word sized");
        debug_assert!(
            size <= MAX_REGULAR_OBJECT_SIZE,
            "{size} bytes belongs in a large object space"
        );

        self.with_state(|state, heap, thread| state.allocate(heap, thread, size, alignment, origin))
    }

    /// Allocate `size` bytes, collecting garbage if needed.
    ///
    /// Ends the process through [`Heap::fatal_process_out_of_memory`] after
    /// [`MAX_COLLECTION_ATTEMPTS`] collections fail to make room.
    pub fn allocate_or_fail(
        &mut self,
        size: usize,
        alignment: AllocationAlignment,
        origin: AllocationOrigin,
    ) -> Address {
        match self.allocate(size, alignment, origin) {
            AllocationResult::Success(address) => address,
            AllocationResult::Retry(_) => {
                self.perform_collection_and_allocate_again(size, alignment, origin)
            }
        }
    }

    fn perform_collection_and_allocate_again(
        &mut self,
        size: usize,
        alignment: AllocationAlignment,
        origin: AllocationOrigin,
    ) -> Address {
        self.thread.set_allocation_failed(true);

        for attempt in 1..=MAX_COLLECTION_ATTEMPTS {
            self.with_state(|state, _, thread| {
                state.stats.collection_retries += 1;
                crate::tracing::internal::log_collection_retry(thread.id(), attempt);
                state.lab.make_iterable();
            });
            {
                let _parked = ParkedScope::new(self.heap.safepoint(), &self.thread);
                self.heap.request_and_wait_for_collection();
            }

            if let AllocationResult::Success(address) = self.allocate(size, alignment, origin) {
                self.thread.set_allocation_failed(false);
                return address;
            }
        }

        self.heap
            .fatal_process_out_of_memory("ConcurrentAllocator::allocate_or_fail")
    }

    /// Close the LAB and give up its remainder.
    pub fn free_linear_allocation_area(&mut self) {
        self.with_state(|state, heap, thread| state.free_lab(heap, thread));
    }

    /// Cover the LAB remainder with a filler without giving it up.
    pub fn make_linear_allocation_area_iterable(&mut self) {
        self.with_state(|state, _, _| state.lab.make_iterable());
    }

    /// Turn the LAB remainder into a black area.
    pub fn mark_linear_allocation_area_black(&mut self) {
        self.with_state(|state, heap, _| state.mark_lab_black(heap));
    }

    /// Undo [`ConcurrentAllocator::mark_linear_allocation_area_black`].
    pub fn unmark_linear_allocation_area(&mut self) {
        self.with_state(|state, heap, _| state.unmark_lab(heap));
    }
}

impl std::fmt::Debug for ConcurrentAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentAllocator")
            .field("thread", &self.thread.id())
            .field("state", self.state())
            .finish_non_exhaustive()
    }
}

/// One thread's LAB, whether its remainder is a black area, and counters.
///
/// Touched by the owning thread while it runs, and by the collector while
/// the owner is parked and the world is stopped.
#[derive(Debug)]
pub(crate) struct AllocatorState {
    lab: LinearAllocationBuffer,
    /// Whether `[lab.top, lab.limit)` is currently a black area.
    lab_black: bool,
    stats: AllocatorStats,
}

impl AllocatorState {
    pub(crate) const fn new() -> Self {
        Self {
            lab: LinearAllocationBuffer::empty(),
            lab_black: false,
            stats: AllocatorStats::new(),
        }
    }

    fn allocate(
        &mut self,
        heap: &Heap,
        thread: &ThreadState,
        size: usize,
        alignment: AllocationAlignment,
        origin: AllocationOrigin,
    ) -> AllocationResult {
        self.sync_black_allocation(heap);

        let result = if size > heap.config().max_lab_object_size {
            self.allocate_outside_lab(heap, thread, size, alignment, origin)
        } else {
            self.allocate_in_lab(heap, thread, size, alignment, origin)
        };
        if let AllocationResult::Success(address) = result {
            // SAFETY: `[address, address + size)` was just carved out for
            // the caller and nobody else can see it yet.
            unsafe { create_filler_object_at(address, size) };
            self.stats.record_allocation(origin, size);
        }
        result
    }

    fn allocate_in_lab(
        &mut self,
        heap: &Heap,
        thread: &ThreadState,
        size: usize,
        alignment: AllocationAlignment,
        origin: AllocationOrigin,
    ) -> AllocationResult {
        let result = self.lab.allocate_raw_aligned(size, alignment);
        if result.is_retry() {
            self.allocate_in_lab_slow(heap, thread, size, alignment, origin)
        } else {
            result
        }
    }

    fn allocate_in_lab_slow(
        &mut self,
        heap: &Heap,
        thread: &ThreadState,
        size: usize,
        alignment: AllocationAlignment,
        origin: AllocationOrigin,
    ) -> AllocationResult {
        if !self.ensure_lab(heap, thread, origin) {
            return AllocationResult::Retry(RetryReason::SpaceExhausted);
        }
        let result = self.lab.allocate_raw_aligned(size, alignment);
        debug_assert!(!result.is_retry(), "fresh LAB cannot hold {size} bytes");
        result
    }

    /// Replace the LAB with a fresh slice, merging the old remainder into it
    /// when the two are adjacent.
    fn ensure_lab(&mut self, heap: &Heap, thread: &ThreadState, origin: AllocationOrigin) -> bool {
        let config = heap.config();
        let Some(slice) = heap.space().request_slice(
            thread,
            config.lab_size,
            config.max_lab_size,
            AllocationAlignment::Word,
            origin,
        ) else {
            return false;
        };

        let black = heap.marking().black_allocation();
        let (start, end) = (slice.start(), slice.end());
        if black {
            heap.create_black_area(start, end);
        }

        let saved = std::mem::replace(&mut self.lab, LinearAllocationBuffer::from_slice(slice));
        // A LAB never spans two pages.
        let same_page = heap
            .space()
            .page_for(saved.top())
            .is_some_and(|page| page.contains(start));
        let merged = if same_page {
            self.lab.try_merge(saved)
        } else {
            Err(saved)
        };
        match merged {
            Ok(()) => {
                let tail = self.lab.top();
                if self.lab_black != black {
                    if black {
                        heap.create_black_area(tail, start);
                    } else {
                        heap.destroy_black_area(tail, start);
                    }
                }
                self.stats.lab_merges += 1;
                crate::tracing::internal::log_lab_refill(thread.id(), tail, end - tail, true);
            }
            Err(saved) => {
                self.retire_lab(heap, thread, saved);
                crate::tracing::internal::log_lab_refill(thread.id(), start, end - start, false);
            }
        }

        self.lab_black = black;
        self.stats.lab_refills += 1;
        debug_assert!(self.lab.is_valid() && self.lab.top() <= self.lab.limit());
        true
    }

    /// Close `lab`, first clearing the black area over its remainder.
    fn retire_lab(&mut self, heap: &Heap, thread: &ThreadState, lab: LinearAllocationBuffer) {
        if !lab.is_valid() {
            return;
        }
        let free = lab.free_bytes();
        if free > 0 {
            if self.lab_black {
                heap.destroy_black_area(lab.top(), lab.limit());
            }
            self.stats.lab_retirements += 1;
            crate::tracing::internal::log_lab_retired(thread.id(), lab.top(), free);
        }
        lab.close_and_make_iterable();
    }

    fn allocate_outside_lab(
        &mut self,
        heap: &Heap,
        thread: &ThreadState,
        size: usize,
        alignment: AllocationAlignment,
        origin: AllocationOrigin,
    ) -> AllocationResult {
        let Some(slice) = heap
            .space()
            .request_slice(thread, size, size, alignment, origin)
        else {
            return AllocationResult::Retry(RetryReason::SpaceExhausted);
        };

        let (address, granted) = slice.into_raw_parts();
        debug_assert_eq!(granted, size);
        if heap.marking().black_allocation() {
            heap.marking()
                .mark_black_background(heap.space(), address, size);
        }

        self.stats.outside_lab_allocations += 1;
        crate::tracing::internal::log_outside_lab(thread.id(), address, size);
        AllocationResult::Success(address)
    }

    /// Bring the LAB remainder in line with the heap's black-allocation flag.
    fn sync_black_allocation(&mut self, heap: &Heap) {
        let active = heap.marking().black_allocation();
        if active == self.lab_black {
            return;
        }
        if active {
            self.mark_lab_black(heap);
        } else {
            self.unmark_lab(heap);
        }
    }

    pub(crate) fn free_lab(&mut self, heap: &Heap, thread: &ThreadState) {
        let lab = std::mem::take(&mut self.lab);
        self.retire_lab(heap, thread, lab);
    }

    pub(crate) fn mark_lab_black(&mut self, heap: &Heap) {
        if self.lab.is_valid() && self.lab.free_bytes() > 0 {
            heap.create_black_area(self.lab.top(), self.lab.limit());
        }
        self.lab_black = true;
    }

    pub(crate) fn unmark_lab(&mut self, heap: &Heap) {
        if self.lab.is_valid() && self.lab.free_bytes() > 0 {
            heap.destroy_black_area(self.lab.top(), self.lab.limit());
        }
        self.lab_black = false;
    }
}
