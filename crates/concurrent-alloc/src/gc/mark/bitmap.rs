//! Atomic mark bitmap with range operations.
//!
//! One bit per word of the covered area. Black areas set whole runs of bits,
//! so every operation here works on half-open bit ranges and reports how many
//! bits it actually flipped. Callers use that count for live-byte accounting,
//! which keeps repeated or overlapping calls idempotent.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const BITS_PER_CELL: usize = 64;

/// A bitmap of `capacity` bits backed by atomic 64-bit cells.
///
/// # Example
///
/// ```
/// use concurrent_alloc::gc::mark::MarkBitmap;
///
/// let bitmap = MarkBitmap::new(512);
/// assert_eq!(bitmap.set_range(10, 20), 10);
/// assert!(bitmap.all_set(10, 20));
/// assert_eq!(bitmap.clear_range(0, 512), 10);
/// ```
#[derive(Debug)]
pub struct MarkBitmap {
    cells: Box<[AtomicU64]>,
    capacity: usize,
    set_count: AtomicUsize,
}

/// Mask of bits `[from, to)` within one cell, `0 <= from < to <= 64`.
#[inline]
const fn cell_mask(from: usize, to: usize) -> u64 {
    let high = if to == BITS_PER_CELL {
        u64::MAX
    } else {
        (1u64 << to) - 1
    };
    let low = (1u64 << from) - 1;
    high & !low
}

impl MarkBitmap {
    /// Create a cleared bitmap of `capacity` bits.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let cells = (0..capacity.div_ceil(BITS_PER_CELL))
            .map(|_| AtomicU64::new(0))
            .collect();
        Self {
            cells,
            capacity,
            set_count: AtomicUsize::new(0),
        }
    }

    /// Number of bits covered.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of bits currently set.
    #[must_use]
    pub fn set_count(&self) -> usize {
        self.set_count.load(Ordering::Relaxed)
    }

    /// Whether bit `index` is set.
    ///
    /// # Panics
    ///
    /// Panics if `index >= capacity`.
    #[must_use]
    pub fn is_set(&self, index: usize) -> bool {
        assert!(index < self.capacity, "bit {index} out of range");
        let cell = self.cells[index / BITS_PER_CELL].load(Ordering::Acquire);
        (cell >> (index % BITS_PER_CELL)) & 1 != 0
    }

    /// Set bits `[from, to)`. Returns how many were previously clear.
    pub fn set_range(&self, from: usize, to: usize) -> usize {
        let changed = self.update_range(from, to, |cell, mask| {
            let prev = cell.fetch_or(mask, Ordering::AcqRel);
            (!prev & mask).count_ones() as usize
        });
        self.set_count.fetch_add(changed, Ordering::Relaxed);
        changed
    }

    /// Clear bits `[from, to)`. Returns how many were previously set.
    pub fn clear_range(&self, from: usize, to: usize) -> usize {
        let changed = self.update_range(from, to, |cell, mask| {
            let prev = cell.fetch_and(!mask, Ordering::AcqRel);
            (prev & mask).count_ones() as usize
        });
        self.set_count.fetch_sub(changed, Ordering::Relaxed);
        changed
    }

    /// Whether every bit in `[from, to)` is set. Empty ranges are trivially set.
    #[must_use]
    pub fn all_set(&self, from: usize, to: usize) -> bool {
        self.count_in_range(from, to) == to.saturating_sub(from)
    }

    /// Whether no bit in `[from, to)` is set.
    #[must_use]
    pub fn none_set(&self, from: usize, to: usize) -> bool {
        self.count_in_range(from, to) == 0
    }

    /// Number of set bits in `[from, to)`.
    #[must_use]
    pub fn count_in_range(&self, from: usize, to: usize) -> usize {
        let mut count = 0;
        self.for_each_cell(from, to, |cell, mask| {
            count += (cell.load(Ordering::Acquire) & mask).count_ones() as usize;
        });
        count
    }

    /// Clear every bit.
    pub fn clear(&self) {
        for cell in &*self.cells {
            cell.store(0, Ordering::Relaxed);
        }
        self.set_count.store(0, Ordering::Relaxed);
    }

    fn update_range(
        &self,
        from: usize,
        to: usize,
        mut op: impl FnMut(&AtomicU64, u64) -> usize,
    ) -> usize {
        let mut changed = 0;
        self.for_each_cell(from, to, |cell, mask| changed += op(cell, mask));
        changed
    }

    fn for_each_cell(&self, from: usize, to: usize, mut f: impl FnMut(&AtomicU64, u64)) {
        assert!(
            from <= to && to <= self.capacity,
            "bit range {from}..{to} out of bounds (capacity {})",
            self.capacity
        );
        let mut bit = from;
        while bit < to {
            let cell_index = bit / BITS_PER_CELL;
            let offset = bit % BITS_PER_CELL;
            let end = (to - cell_index * BITS_PER_CELL).min(BITS_PER_CELL);
            f(&self.cells[cell_index], cell_mask(offset, end));
            bit = (cell_index + 1) * BITS_PER_CELL;
        }
    }
}
