//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use concurrent_alloc::heap::filler::create_filler_object_at;
use concurrent_alloc::heap::Page;
use concurrent_alloc::{
    Address, AllocationAlignment, AllocationOrigin, GarbageCollector, Heap, HeapConfig,
    Platform, SharedSpace, Slice, Task, ThreadState,
};
use parking_lot::Mutex;

pub const WORD: usize = std::mem::size_of::<usize>();

/// A one-page space over a heap-allocated buffer.
///
/// Grants are carved from a bump pointer, so consecutive requests are
/// adjacent unless a gap is configured. Requests can be made to fail.
pub struct MockSpace {
    base: Address,
    layout: Layout,
    page: Page,
    next: Mutex<Address>,
    gap: usize,
    fail_next: AtomicUsize,
    requests: AtomicUsize,
    grants: Mutex<Vec<(Address, usize)>>,
}

impl MockSpace {
    pub fn new(size: usize) -> Self {
        Self::with_gap(size, 0)
    }

    /// Leave `gap` bytes between consecutive grants.
    pub fn with_gap(size: usize, gap: usize) -> Self {
        let layout = Layout::from_size_align(size, 64).unwrap();
        let base = unsafe { alloc_zeroed(layout) } as Address;
        assert_ne!(base, 0);
        Self {
            base,
            layout,
            page: Page::new(base, size),
            next: Mutex::new(base),
            gap,
            fail_next: AtomicUsize::new(0),
            requests: AtomicUsize::new(0),
            grants: Mutex::new(Vec::new()),
        }
    }

    /// Make the next `n` requests fail.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn grants(&self) -> Vec<(Address, usize)> {
        self.grants.lock().clone()
    }

    pub fn end(&self) -> Address {
        self.base + self.layout.size()
    }
}

unsafe impl SharedSpace for MockSpace {
    fn request_slice(
        &self,
        _requester: &ThreadState,
        min_size: usize,
        max_size: usize,
        alignment: AllocationAlignment,
        _origin: AllocationOrigin,
    ) -> Option<Slice> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return None;
        }

        let mut next = self.next.lock();
        let fill = alignment.fill_to_align(*next);
        let start = *next + fill;
        let end = (start + max_size).min(self.end());
        if end < start + min_size {
            return None;
        }
        unsafe { create_filler_object_at(*next, fill) };
        *next = (end + self.gap).min(self.end());
        self.grants.lock().push((start, end - start));
        Some(unsafe { Slice::new(start, end - start) })
    }

    fn page_for(&self, address: Address) -> Option<&Page> {
        self.page.contains(address).then_some(&self.page)
    }
}

impl Drop for MockSpace {
    fn drop(&mut self) {
        unsafe { dealloc(self.base as *mut u8, self.layout) };
    }
}

/// Counts collections and records how many threads were still running.
#[derive(Default)]
pub struct CountingCollector {
    pub collections: Arc<AtomicUsize>,
    pub max_running_seen: Arc<AtomicUsize>,
}

impl CountingCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.collections)
    }
}

impl GarbageCollector for CountingCollector {
    fn collect_garbage(&self, heap: &Heap) {
        self.max_running_seen
            .fetch_max(heap.safepoint().running_threads(), Ordering::SeqCst);
        self.collections.fetch_add(1, Ordering::SeqCst);
    }
}

/// Keeps scheduled tasks instead of running them.
#[derive(Default)]
pub struct RecordingPlatform {
    tasks: Mutex<Vec<(Box<dyn Task>, Option<Duration>)>>,
}

impl RecordingPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn delays(&self) -> Vec<Option<Duration>> {
        self.tasks.lock().iter().map(|(_, delay)| *delay).collect()
    }

    pub fn take(&self) -> Vec<Box<dyn Task>> {
        self.tasks.lock().drain(..).map(|(task, _)| task).collect()
    }
}

impl Platform for RecordingPlatform {
    fn call_on_worker_thread(&self, task: Box<dyn Task>) {
        self.tasks.lock().push((task, None));
    }

    fn call_delayed_on_worker_thread(&self, task: Box<dyn Task>, delay: Duration) {
        self.tasks.lock().push((task, Some(delay)));
    }
}

/// Default sizing with a small reservation.
pub fn small_config() -> HeapConfig {
    HeapConfig {
        reservation_size: 4 * concurrent_alloc::heap::PAGE_SIZE,
        ..HeapConfig::default()
    }
}

pub fn mock_heap(space: &Arc<MockSpace>) -> Arc<Heap> {
    Heap::builder(small_config())
        .space(Arc::clone(space) as Arc<dyn SharedSpace>)
        .build()
        .unwrap()
}

/// Assert that no two `(address, size)` ranges overlap.
pub fn assert_disjoint(ranges: &mut [(Address, usize)]) {
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        let (a, a_size) = pair[0];
        let (b, _) = pair[1];
        assert!(
            a + a_size <= b,
            "{a:#x}+{a_size} overlaps allocation at {b:#x}"
        );
    }
}
