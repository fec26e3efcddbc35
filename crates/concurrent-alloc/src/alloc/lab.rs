//! Thread-private linear allocation buffers.

use crate::alloc::{Address, AllocationAlignment, AllocationResult, RetryReason, NULL_ADDRESS};
use crate::heap::filler::create_filler_object_at;
use crate::heap::Slice;

/// A free range `[top, limit)` owned by one thread and consumed by bumping
/// `top`.
///
/// A buffer is only ever built from a [`Slice`], so `top <= limit` holds from
/// construction on and `top` never decreases. Dropping a buffer closes it:
/// the unused remainder is covered by a filler object.
#[derive(Debug, PartialEq, Eq)]
pub struct LinearAllocationBuffer {
    top: Address,
    limit: Address,
}

impl Default for LinearAllocationBuffer {
    fn default() -> Self {
        Self::empty()
    }
}

impl LinearAllocationBuffer {
    /// A buffer holding no memory.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            top: NULL_ADDRESS,
            limit: NULL_ADDRESS,
        }
    }

    /// Take ownership of a granted slice.
    #[must_use]
    pub const fn from_slice(slice: Slice) -> Self {
        let (start, size) = slice.into_raw_parts();
        Self {
            top: start,
            limit: start + size,
        }
    }

    #[must_use]
    pub const fn top(&self) -> Address {
        self.top
    }

    #[must_use]
    pub const fn limit(&self) -> Address {
        self.limit
    }

    /// Whether the buffer holds memory at all.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.top != NULL_ADDRESS
    }

    #[must_use]
    pub const fn free_bytes(&self) -> usize {
        self.limit - self.top
    }

    /// Bump-allocate `size` bytes, writing a filler over any alignment fill.
    pub fn allocate_raw_aligned(
        &mut self,
        size: usize,
        alignment: AllocationAlignment,
    ) -> AllocationResult {
        let fill = alignment.fill_to_align(self.top);
        if !self.is_valid() || self.free_bytes() < fill + size {
            return AllocationResult::Retry(RetryReason::LabExhausted);
        }

        // SAFETY: `[top, top + fill)` is free memory owned by this buffer.
        unsafe { create_filler_object_at(self.top, fill) };
        let address = self.top + fill;
        self.top = address + size;
        debug_assert!(self.top <= self.limit);
        AllocationResult::Success(address)
    }

    /// Absorb `other` if its free range ends exactly where this one starts.
    ///
    /// On success this buffer becomes `[other.top, self.limit)` and `other`
    /// is consumed without writing a filler. On failure `other` is handed
    /// back untouched.
    ///
    /// # Errors
    ///
    /// Returns `other` when the two ranges are not adjacent.
    pub fn try_merge(&mut self, mut other: Self) -> Result<(), Self> {
        if !self.is_valid() || self.top != other.limit {
            return Err(other);
        }
        self.top = other.top;
        other.top = NULL_ADDRESS;
        other.limit = NULL_ADDRESS;
        Ok(())
    }

    /// Cover the free remainder with a filler while keeping ownership of it.
    pub fn make_iterable(&mut self) {
        if self.is_valid() {
            // SAFETY: `[top, limit)` is free memory owned by this buffer.
            unsafe { create_filler_object_at(self.top, self.free_bytes()) };
        }
    }

    /// Cover the free remainder with a filler and give it up.
    pub fn close_and_make_iterable(mut self) {
        self.make_iterable();
        self.top = NULL_ADDRESS;
        self.limit = NULL_ADDRESS;
    }
}

impl Drop for LinearAllocationBuffer {
    fn drop(&mut self) {
        self.make_iterable();
    }
}
