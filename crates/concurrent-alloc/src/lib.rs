//! Concurrent allocation into a shared old-generation heap.
//!
//! Every thread that allocates registers a [`LocalHeap`] and allocates
//! through its [`ConcurrentAllocator`]. The allocator bumps a pointer inside
//! a thread-private linear allocation buffer (LAB) and only touches shared
//! state when the buffer runs dry, when an object is too large for it, or
//! when the shared space is exhausted and a collection has to run.
//!
//! # Features
//!
//! - **Lock-free fast path**: bump allocation inside a thread-owned LAB
//! - **Adjacent LAB merging**: consecutive slices from the space coalesce
//! - **Black allocation**: memory handed out during incremental marking is
//!   marked live before the caller sees it
//! - **Bounded retry**: exhaustion triggers at most
//!   [`MAX_COLLECTION_ATTEMPTS`] collections before a fatal OOM
//!
//! # Quick Start
//!
//! ```
//! use concurrent_alloc::{AllocationAlignment, AllocationOrigin, Heap, HeapConfig, LocalHeap};
//!
//! let heap = Heap::new(HeapConfig::default())?;
//! let mut local = LocalHeap::new(&heap);
//!
//! let address = local.old_space_allocator().allocate_or_fail(
//!     64,
//!     AllocationAlignment::Word,
//!     AllocationOrigin::Runtime,
//! );
//! assert_eq!(address % std::mem::size_of::<usize>(), 0);
//! # Ok::<(), concurrent_alloc::HeapError>(())
//! ```
//!
//! # Threads
//!
//! [`LocalHeap`] is `!Send`: create one on each thread that allocates. Long
//! allocation loops must call [`LocalHeap::safepoint`] now and then, or a
//! collection requested by another thread cannot start.

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod alloc;
pub mod config;
pub mod error;
pub mod gc;
pub mod heap;
pub mod local_heap;
pub mod metrics;
pub mod platform;
pub mod stress;
mod tracing;

// Re-export public API
pub use alloc::{
    Address, AllocationAlignment, AllocationOrigin, AllocationResult, ConcurrentAllocator,
    LinearAllocationBuffer, RetryReason, MAX_COLLECTION_ATTEMPTS,
};
pub use config::HeapConfig;
pub use error::HeapError;
pub use gc::{GarbageCollector, IncrementalMarking, ParkedScope, SweepingCollector};
pub use heap::{Heap, HeapBuilder, OldSpace, SharedSpace, Slice};
pub use local_heap::{LocalHeap, ThreadState};
pub use metrics::{AllocatorStats, HeapMetricsSnapshot};
pub use platform::{Platform, Task, WorkerPool};
pub use stress::{StressConcurrentAllocatorTask, StressReport};
