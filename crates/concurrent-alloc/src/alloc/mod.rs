//! Allocation primitives shared by the fast and slow paths.
//!
//! Addresses are plain `usize` values. Every object size and every address
//! handed out by this crate is a multiple of [`WORD_SIZE`].

mod concurrent;
mod lab;

pub(crate) use concurrent::AllocatorState;
pub use concurrent::{ConcurrentAllocator, MAX_COLLECTION_ATTEMPTS};
pub use lab::LinearAllocationBuffer;

use crate::heap::{DOUBLE_WORD_SIZE, WORD_SIZE};

/// A raw address inside the managed heap.
pub type Address = usize;

/// The address of an empty linear allocation buffer.
pub const NULL_ADDRESS: Address = 0;

/// Alignment requirement of an allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AllocationAlignment {
    /// Any word boundary.
    #[default]
    Word,
    /// A multiple of [`DOUBLE_WORD_SIZE`].
    DoubleAligned,
    /// One word past a multiple of [`DOUBLE_WORD_SIZE`].
    DoubleUnaligned,
}

impl AllocationAlignment {
    /// Bytes of filler needed in front of `address` to satisfy this alignment.
    #[must_use]
    pub const fn fill_to_align(self, address: Address) -> usize {
        let misaligned = address & (DOUBLE_WORD_SIZE - 1) != 0;
        match self {
            Self::Word => 0,
            Self::DoubleAligned if misaligned => WORD_SIZE,
            Self::DoubleUnaligned if !misaligned => WORD_SIZE,
            Self::DoubleAligned | Self::DoubleUnaligned => 0,
        }
    }

    /// Worst-case filler for this alignment.
    #[must_use]
    pub const fn max_fill(self) -> usize {
        match self {
            Self::Word => 0,
            Self::DoubleAligned | Self::DoubleUnaligned => WORD_SIZE,
        }
    }
}

/// Who asked for the memory. Used for accounting only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum AllocationOrigin {
    /// Allocation from generated code.
    Generated = 0,
    /// Allocation from the runtime.
    Runtime = 1,
    /// Allocation made by the collector itself.
    Gc = 2,
}

impl AllocationOrigin {
    /// Number of origins, for per-origin counter arrays.
    pub const COUNT: usize = 3;

    /// Index into per-origin counter arrays.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Why an allocation attempt has to fall back to a slower path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// The open linear allocation buffer is too small.
    LabExhausted,
    /// The shared space could not grant a slice.
    SpaceExhausted,
}

/// Outcome of a non-failing allocation attempt.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationResult {
    /// The range `[address, address + size)` now belongs to the caller.
    Success(Address),
    /// Nothing was allocated; fall back to a slower path.
    Retry(RetryReason),
}

impl AllocationResult {
    /// Whether this result asks the caller to retry.
    #[must_use]
    pub const fn is_retry(&self) -> bool {
        matches!(self, Self::Retry(_))
    }

    /// The allocated address, if any.
    #[must_use]
    pub const fn address(&self) -> Option<Address> {
        match *self {
            Self::Success(address) => Some(address),
            Self::Retry(_) => None,
        }
    }
}
