//! The shared heap: old space, marking state, safepoint and collector.

pub mod filler;
pub mod page;
pub mod space;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub use page::Page;
pub use space::{OldSpace, SharedSpace, Slice};

use crate::alloc::Address;
use crate::config::HeapConfig;
use crate::error::HeapError;
use crate::gc::{GarbageCollector, GlobalSafepoint, IncrementalMarking, SweepingCollector};
use crate::metrics::HeapMetrics;

// ============================================================================
// Constants
// ============================================================================

/// Size of a machine word; the allocation granule.
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// Size of two machine words.
pub const DOUBLE_WORD_SIZE: usize = 2 * WORD_SIZE;

pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;

/// Size of an old-space page, and its alignment.
pub const PAGE_SIZE: usize = 256 * KB;

/// Largest object this heap allocates; bigger ones belong in a
/// large-object space.
pub const MAX_REGULAR_OBJECT_SIZE: usize = PAGE_SIZE / 2;

/// Called when allocation fails for good. Must not return.
pub type OomHandler = fn(&str) -> !;

fn default_oom_handler(location: &str) -> ! {
    eprintln!("Fatal process out of memory: {location}");
    std::process::abort()
}

// ============================================================================
// Heap
// ============================================================================

/// State shared by every [`LocalHeap`](crate::LocalHeap) of one heap.
pub struct Heap {
    config: HeapConfig,
    space: Arc<dyn SharedSpace>,
    marking: IncrementalMarking,
    safepoint: GlobalSafepoint,
    collector: Box<dyn GarbageCollector>,
    metrics: HeapMetrics,
    oom_handler: OomHandler,
    next_thread_id: AtomicUsize,
    tearing_down: AtomicBool,
}

impl Heap {
    /// Create a heap backed by a fresh [`OldSpace`] and a [`SweepingCollector`].
    ///
    /// # Errors
    ///
    /// Fails if `config` is invalid or the reservation cannot be mapped.
    pub fn new(config: HeapConfig) -> Result<Arc<Self>, HeapError> {
        Self::builder(config).build()
    }

    #[must_use]
    pub fn builder(config: HeapConfig) -> HeapBuilder {
        HeapBuilder {
            config,
            space: None,
            collector: None,
            oom_handler: default_oom_handler,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &HeapConfig {
        &self.config
    }

    #[must_use]
    pub fn space(&self) -> &dyn SharedSpace {
        &*self.space
    }

    #[must_use]
    pub const fn marking(&self) -> &IncrementalMarking {
        &self.marking
    }

    #[must_use]
    pub const fn safepoint(&self) -> &GlobalSafepoint {
        &self.safepoint
    }

    #[must_use]
    pub const fn metrics(&self) -> &HeapMetrics {
        &self.metrics
    }

    pub(crate) fn collector(&self) -> &dyn GarbageCollector {
        &*self.collector
    }

    pub(crate) fn next_thread_id(&self) -> usize {
        self.next_thread_id.fetch_add(1, Ordering::Relaxed)
    }

    fn page_for_area(&self, start: Address, end: Address) -> &Page {
        self.space
            .page_for(start)
            .unwrap_or_else(|| panic!("black area {start:#x}..{end:#x} outside the heap"))
    }

    /// Mark `[start, end)` black on its page.
    ///
    /// # Panics
    ///
    /// Panics if the space has no page for `start`.
    pub fn create_black_area(&self, start: Address, end: Address) {
        if start != end {
            self.page_for_area(start, end).create_black_area(start, end);
        }
    }

    /// Undo [`Heap::create_black_area`] for `[start, end)`.
    ///
    /// # Panics
    ///
    /// Panics if the space has no page for `start`.
    pub fn destroy_black_area(&self, start: Address, end: Address) {
        if start != end {
            self.page_for_area(start, end).destroy_black_area(start, end);
        }
    }

    /// Block until a full collection has run.
    ///
    /// The calling thread must be parked.
    pub fn request_and_wait_for_collection(&self) {
        self.safepoint.request_and_wait_for_collection(self);
    }

    // ------------------------------------------------------------------------
    // Stopped-world operations, for use by a `GarbageCollector`
    // ------------------------------------------------------------------------

    /// Close the LAB of every registered thread.
    ///
    /// # Panics
    ///
    /// Panics unless called while a collection is running.
    pub fn free_linear_allocation_areas(&self) {
        self.safepoint.for_each_parked_thread(|thread| {
            // SAFETY: the world is stopped and `thread` is parked.
            unsafe { thread.with_allocator_state(|state| state.free_lab(self, thread)) };
        });
    }

    /// Turn the LAB remainder of every registered thread into a black area.
    ///
    /// Call after [`IncrementalMarking::start_black_allocation`] so that
    /// parked and idle threads are covered too.
    ///
    /// # Panics
    ///
    /// Panics unless called while a collection is running.
    pub fn mark_linear_allocation_areas_black(&self) {
        self.safepoint.for_each_parked_thread(|thread| {
            // SAFETY: the world is stopped and `thread` is parked.
            unsafe { thread.with_allocator_state(|state| state.mark_lab_black(self)) };
        });
    }

    /// Undo [`Heap::mark_linear_allocation_areas_black`].
    ///
    /// # Panics
    ///
    /// Panics unless called while a collection is running.
    pub fn unmark_linear_allocation_areas(&self) {
        self.safepoint.for_each_parked_thread(|thread| {
            // SAFETY: the world is stopped and `thread` is parked.
            unsafe { thread.with_allocator_state(|state| state.unmark_lab(self)) };
        });
    }

    /// Close every LAB, then let the space reclaim memory that holds only
    /// unmarked fillers. Returns the bytes reclaimed.
    ///
    /// # Panics
    ///
    /// Panics unless called while a collection is running.
    pub fn sweep(&self) -> usize {
        self.free_linear_allocation_areas();
        // SAFETY: every LAB is closed and the world stays stopped until the
        // collector returns.
        let reclaimed = unsafe { self.space.sweep() };
        self.metrics.record_sweep(reclaimed);
        crate::tracing::internal::log_sweep(reclaimed);
        reclaimed
    }

    /// Report an unrecoverable allocation failure and end the process.
    pub fn fatal_process_out_of_memory(&self, location: &str) -> ! {
        crate::tracing::internal::log_fatal_oom(location);
        (self.oom_handler)(location)
    }

    /// Stop self-rescheduling background work.
    pub fn start_tear_down(&self) {
        self.tearing_down.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_tearing_down(&self) -> bool {
        self.tearing_down.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("config", &self.config)
            .field("black_allocation", &self.marking.black_allocation())
            .field("tearing_down", &self.is_tearing_down())
            .finish_non_exhaustive()
    }
}

/// Assembles a [`Heap`] with injected collaborators.
pub struct HeapBuilder {
    config: HeapConfig,
    space: Option<Arc<dyn SharedSpace>>,
    collector: Option<Box<dyn GarbageCollector>>,
    oom_handler: OomHandler,
}

impl HeapBuilder {
    /// Use `space` instead of reserving an [`OldSpace`].
    #[must_use]
    pub fn space(mut self, space: Arc<dyn SharedSpace>) -> Self {
        self.space = Some(space);
        self
    }

    #[must_use]
    pub fn collector(mut self, collector: impl GarbageCollector + 'static) -> Self {
        self.collector = Some(Box::new(collector));
        self
    }

    /// Replace the handler that ends the process on fatal OOM.
    #[cfg(any(test, feature = "test-util"))]
    #[must_use]
    pub fn on_out_of_memory(mut self, handler: OomHandler) -> Self {
        self.oom_handler = handler;
        self
    }

    /// # Errors
    ///
    /// Fails if the config is invalid or the default space cannot be
    /// reserved.
    pub fn build(self) -> Result<Arc<Heap>, HeapError> {
        self.config.validate()?;

        let space = match self.space {
            Some(space) => space,
            None => Arc::new(OldSpace::new(self.config.reservation_size)?),
        };

        Ok(Arc::new(Heap {
            config: self.config,
            space,
            marking: IncrementalMarking::new(),
            safepoint: GlobalSafepoint::new(),
            collector: self.collector.unwrap_or_else(|| Box::new(SweepingCollector)),
            metrics: HeapMetrics::new(),
            oom_handler: self.oom_handler,
            next_thread_id: AtomicUsize::new(1),
            tearing_down: AtomicBool::new(false),
        }))
    }
}
