//! Incremental marking state visible to allocators.
//!
//! While black allocation is active every byte handed out by an allocator
//! must already be marked, so a concurrent marker treats it as live without
//! tracing it. Allocators read the flag on every allocation and reconcile
//! their open LAB with it.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::alloc::Address;
use crate::heap::SharedSpace;

#[derive(Debug, Default)]
pub struct IncrementalMarking {
    black_allocation: AtomicBool,
}

impl IncrementalMarking {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            black_allocation: AtomicBool::new(false),
        }
    }

    /// Whether new allocations must be marked black.
    #[must_use]
    pub fn black_allocation(&self) -> bool {
        self.black_allocation.load(Ordering::Acquire)
    }

    pub fn start_black_allocation(&self) {
        if !self.black_allocation.swap(true, Ordering::AcqRel) {
            crate::tracing::internal::log_black_allocation(true);
        }
    }

    pub fn finish_black_allocation(&self) {
        if self.black_allocation.swap(false, Ordering::AcqRel) {
            crate::tracing::internal::log_black_allocation(false);
        }
    }

    /// Mark the object `[address, address + size)` black from a background
    /// thread.
    ///
    /// # Panics
    ///
    /// Panics if `space` has no page for `address`.
    pub fn mark_black_background(&self, space: &dyn SharedSpace, address: Address, size: usize) {
        space
            .page_for(address)
            .unwrap_or_else(|| panic!("object {address:#x} outside the heap"))
            .mark_black(address, size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggle_black_allocation() {
        let marking = IncrementalMarking::new();
        assert!(!marking.black_allocation());
        marking.start_black_allocation();
        marking.start_black_allocation();
        assert!(marking.black_allocation());
        marking.finish_black_allocation();
        assert!(!marking.black_allocation());
    }

    #[test]
    #[should_panic(expected = "outside the heap")]
    fn test_marking_outside_the_space_panics() {
        let space = crate::heap::OldSpace::new(crate::heap::PAGE_SIZE).unwrap();
        IncrementalMarking::new().mark_black_background(&space, 0x10, 16);
    }
}
