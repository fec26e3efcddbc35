//! Filler objects.
//!
//! Free ranges inside granted memory are covered by fillers so a heap walker
//! can step over them. A one-word range holds [`ONE_WORD_FILLER_MAGIC`]; any
//! longer range holds [`FILLER_MAGIC`] followed by its size in bytes.

use crate::alloc::Address;
use crate::heap::WORD_SIZE;

/// Header word of a filler spanning two or more words ("FILL" in ASCII).
pub const FILLER_MAGIC: usize = 0x4649_4C4C;

/// A filler that is exactly one word long ("FIL1" in ASCII).
pub const ONE_WORD_FILLER_MAGIC: usize = 0x4649_4C31;

/// Write a filler over `[address, address + size)`.
///
/// A zero `size` writes nothing.
///
/// # Safety
///
/// The range must be writable memory exclusively owned by the caller, and
/// `address` and `size` must be word multiples.
pub unsafe fn create_filler_object_at(address: Address, size: usize) {
    debug_assert_eq!(address % WORD_SIZE, 0, "unaligned filler at {address:#x}");
    debug_assert_eq!(size % WORD_SIZE, 0, "filler size {size} is not word sized");

    let words = address as *mut usize;
    // SAFETY: the caller owns at least `size` bytes at `address`.
    unsafe {
        match size {
            0 => {}
            WORD_SIZE => words.write(ONE_WORD_FILLER_MAGIC),
            _ => {
                words.write(FILLER_MAGIC);
                words.add(1).write(size);
            }
        }
    }
}

/// Size of the filler starting at `address`, or `None` if there is none.
///
/// # Safety
///
/// At least one word at `address` must be readable, and two if it holds a
/// [`FILLER_MAGIC`] header.
#[must_use]
pub unsafe fn filler_size_at(address: Address) -> Option<usize> {
    let words = address as *const usize;
    // SAFETY: upheld by the caller.
    unsafe {
        match words.read() {
            ONE_WORD_FILLER_MAGIC => Some(WORD_SIZE),
            FILLER_MAGIC => Some(words.add(1).read()),
            _ => None,
        }
    }
}
