//! Per-thread view of a [`Heap`].

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::alloc::{AllocatorState, ConcurrentAllocator};
use crate::gc::ParkedScope;
use crate::heap::Heap;

/// Thread state shared between a [`LocalHeap`] and the safepoint.
///
/// Also holds the thread's allocation state, so a collector can reach the
/// LAB of a parked thread.
#[derive(Debug)]
pub struct ThreadState {
    id: usize,
    parked: AtomicBool,
    allocation_failed: AtomicBool,
    allocator: UnsafeCell<AllocatorState>,
}

// SAFETY: `allocator` is only accessed by the running owner or, while the
// owner is parked, by the collector with the world stopped. The safepoint
// mutex orders the two.
unsafe impl Sync for ThreadState {}

impl ThreadState {
    #[must_use]
    pub const fn new(id: usize) -> Self {
        Self {
            id,
            parked: AtomicBool::new(false),
            allocation_failed: AtomicBool::new(false),
            allocator: UnsafeCell::new(AllocatorState::new()),
        }
    }

    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    #[must_use]
    pub fn is_parked(&self) -> bool {
        self.parked.load(Ordering::Acquire)
    }

    pub(crate) fn set_parked(&self, parked: bool) {
        self.parked.store(parked, Ordering::Release);
    }

    /// Set while the thread is stuck in the collection retry loop.
    #[must_use]
    pub fn allocation_failed(&self) -> bool {
        self.allocation_failed.load(Ordering::Acquire)
    }

    pub(crate) fn set_allocation_failed(&self, failed: bool) {
        self.allocation_failed.store(failed, Ordering::Release);
    }

    /// # Safety
    ///
    /// The caller is the owning thread and is not parked, or the world is
    /// stopped and this thread is parked. No other borrow of the state may
    /// be live.
    pub(crate) unsafe fn with_allocator_state<R>(
        &self,
        f: impl FnOnce(&mut AllocatorState) -> R,
    ) -> R {
        // SAFETY: upheld by the caller.
        f(unsafe { &mut *self.allocator.get() })
    }

    /// # Safety
    ///
    /// As for [`ThreadState::with_allocator_state`], for as long as the
    /// returned borrow lives.
    pub(crate) unsafe fn allocator_state(&self) -> &AllocatorState {
        // SAFETY: upheld by the caller.
        unsafe { &*self.allocator.get() }
    }
}

/// A thread's registration with a [`Heap`], owning its old-space allocator.
///
/// Stays on the thread that created it.
pub struct LocalHeap {
    heap: Arc<Heap>,
    thread: Arc<ThreadState>,
    old_space_allocator: ConcurrentAllocator,
    _not_send: PhantomData<*const ()>,
}

impl LocalHeap {
    /// Register the current thread with `heap`.
    ///
    /// Blocks while a collection is running.
    #[must_use]
    pub fn new(heap: &Arc<Heap>) -> Self {
        let thread = Arc::new(ThreadState::new(heap.next_thread_id()));
        heap.safepoint().register(&thread);
        Self {
            heap: Arc::clone(heap),
            old_space_allocator: ConcurrentAllocator::new(Arc::clone(heap), Arc::clone(&thread)),
            thread,
            _not_send: PhantomData,
        }
    }

    #[must_use]
    pub const fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    #[must_use]
    pub fn thread_id(&self) -> usize {
        self.thread.id()
    }

    pub fn old_space_allocator(&mut self) -> &mut ConcurrentAllocator {
        &mut self.old_space_allocator
    }

    /// Stop here if a collection has been requested.
    pub fn safepoint(&mut self) {
        if !self.heap.safepoint().is_pause_requested() {
            return;
        }
        self.old_space_allocator.make_linear_allocation_area_iterable();
        let _parked = ParkedScope::new(self.heap.safepoint(), &self.thread);
    }

    /// Park the thread until the returned scope is dropped.
    pub fn parked_scope(&self) -> ParkedScope<'_> {
        ParkedScope::new(self.heap.safepoint(), &self.thread)
    }

    #[must_use]
    pub fn is_parked(&self) -> bool {
        self.thread.is_parked()
    }

    #[must_use]
    pub fn allocation_failed(&self) -> bool {
        self.thread.allocation_failed()
    }
}

impl Drop for LocalHeap {
    fn drop(&mut self) {
        self.old_space_allocator.free_linear_allocation_area();
        self.heap
            .metrics()
            .absorb(self.old_space_allocator.stats());
        self.heap.space().release_requester(&self.thread);
        self.heap.safepoint().unregister(&self.thread);
    }
}

impl std::fmt::Debug for LocalHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalHeap")
            .field("thread", &self.thread)
            .field("old_space_allocator", &self.old_space_allocator)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{AllocationAlignment, AllocationOrigin};
    use crate::config::HeapConfig;
    use crate::heap::{filler::filler_size_at, OldSpace, PAGE_SIZE};

    fn heap() -> Arc<Heap> {
        Heap::new(HeapConfig {
            reservation_size: 2 * PAGE_SIZE,
            ..HeapConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_register_and_unregister() {
        let heap = heap();
        {
            let _a = LocalHeap::new(&heap);
            let _b = LocalHeap::new(&heap);
            assert_eq!(heap.safepoint().registered_threads(), 2);
            assert_eq!(heap.safepoint().running_threads(), 2);
        }
        assert_eq!(heap.safepoint().registered_threads(), 0);
    }

    #[test]
    fn test_parked_scope() {
        let heap = heap();
        let local = LocalHeap::new(&heap);
        {
            let _parked = local.parked_scope();
            assert!(local.is_parked());
        }
        assert!(!local.is_parked());
    }

    #[test]
    fn test_safepoint_without_request_is_noop() {
        let heap = heap();
        let mut local = LocalHeap::new(&heap);
        local.safepoint();
        assert!(!local.is_parked());
        assert_eq!(heap.safepoint().epoch(), 0);
    }

    #[test]
    fn test_drop_closes_lab_and_folds_stats() {
        let heap = heap();
        let (top, limit) = {
            let mut local = LocalHeap::new(&heap);
            let allocator = local.old_space_allocator();
            let _ = allocator.allocate(64, AllocationAlignment::Word, AllocationOrigin::Runtime);
            (allocator.lab().top(), allocator.lab().limit())
        };

        assert_eq!(unsafe { filler_size_at(top) }, Some(limit - top));
        let snapshot = heap.metrics().snapshot();
        assert_eq!(snapshot.lab_refills, 1);
        assert_eq!(snapshot.bytes_allocated, 64);
    }

    #[test]
    fn test_drop_forgets_thread_accounting() {
        let space = Arc::new(OldSpace::new(4 * PAGE_SIZE).unwrap());
        let heap = Heap::builder(HeapConfig {
            reservation_size: 4 * PAGE_SIZE,
            ..HeapConfig::default()
        })
        .space(space.clone())
        .build()
        .unwrap();

        let mut ids = Vec::new();
        for _ in 0..16 {
            let mut local = LocalHeap::new(&heap);
            let _ = local.old_space_allocator().allocate(
                64,
                AllocationAlignment::Word,
                AllocationOrigin::Runtime,
            );
            ids.push(local.thread_id());
            assert!(space.outstanding_bytes(local.thread_id()) > 0);
        }

        assert!(ids.iter().all(|&id| space.outstanding_bytes(id) == 0));
    }
}
