//! Page metadata and black-area bookkeeping.
//!
//! Metadata lives out of line: the space keeps one [`Page`] per
//! [`PAGE_SIZE`](crate::heap::PAGE_SIZE) chunk of its reservation, and the
//! page area itself is entirely allocatable.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::alloc::Address;
use crate::gc::mark::MarkBitmap;
use crate::heap::WORD_SIZE;

/// Metadata for one contiguous page area.
#[derive(Debug)]
pub struct Page {
    area_start: Address,
    area_end: Address,
    marking_bitmap: MarkBitmap,
    live_bytes: AtomicUsize,
}

impl Page {
    /// Create metadata for `[area_start, area_start + area_size)`.
    ///
    /// # Panics
    ///
    /// Panics if the area is not word aligned and word sized.
    #[must_use]
    pub fn new(area_start: Address, area_size: usize) -> Self {
        assert!(
            area_start % WORD_SIZE == 0 && area_size % WORD_SIZE == 0,
            "page area must be word aligned"
        );
        Self {
            area_start,
            area_end: area_start + area_size,
            marking_bitmap: MarkBitmap::new(area_size / WORD_SIZE),
            live_bytes: AtomicUsize::new(0),
        }
    }

    /// First address of the page area.
    #[must_use]
    pub const fn area_start(&self) -> Address {
        self.area_start
    }

    /// One past the last address of the page area.
    #[must_use]
    pub const fn area_end(&self) -> Address {
        self.area_end
    }

    /// Whether `address` lies in the page area.
    #[must_use]
    pub const fn contains(&self, address: Address) -> bool {
        address >= self.area_start && address < self.area_end
    }

    /// Bytes currently marked live on this page.
    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    /// Mark `[start, end)` black so the marker treats it as live without
    /// visiting it. Idempotent.
    pub fn create_black_area(&self, start: Address, end: Address) {
        let (from, to) = self.bit_range(start, end);
        let newly_set = self.marking_bitmap.set_range(from, to);
        self.live_bytes
            .fetch_add(newly_set * WORD_SIZE, Ordering::Relaxed);
    }

    /// Return `[start, end)` to normal tracing. Exact inverse of
    /// [`Page::create_black_area`] on the same range. Idempotent.
    pub fn destroy_black_area(&self, start: Address, end: Address) {
        let (from, to) = self.bit_range(start, end);
        let cleared = self.marking_bitmap.clear_range(from, to);
        self.live_bytes.fetch_sub(cleared * WORD_SIZE, Ordering::Relaxed);
    }

    /// Mark the object at `address` black.
    pub fn mark_black(&self, address: Address, size: usize) {
        self.create_black_area(address, address + size);
    }

    /// Whether the word at `address` is marked.
    #[must_use]
    pub fn is_black(&self, address: Address) -> bool {
        let (from, _) = self.bit_range(address, address + WORD_SIZE);
        self.marking_bitmap.is_set(from)
    }

    /// Whether every word in `[start, end)` is marked.
    #[must_use]
    pub fn is_range_black(&self, start: Address, end: Address) -> bool {
        let (from, to) = self.bit_range(start, end);
        self.marking_bitmap.all_set(from, to)
    }

    /// Whether no word in `[start, end)` is marked.
    #[must_use]
    pub fn is_range_white(&self, start: Address, end: Address) -> bool {
        let (from, to) = self.bit_range(start, end);
        self.marking_bitmap.none_set(from, to)
    }

    /// Clear all marks, e.g. when a marking cycle ends.
    pub fn clear_marks(&self) {
        self.marking_bitmap.clear();
        self.live_bytes.store(0, Ordering::Relaxed);
    }

    fn bit_range(&self, start: Address, end: Address) -> (usize, usize) {
        debug_assert!(
            start <= end && start >= self.area_start && end <= self.area_end,
            "range {start:#x}..{end:#x} outside page {:#x}..{:#x}",
            self.area_start,
            self.area_end
        );
        debug_assert!(start % WORD_SIZE == 0 && end % WORD_SIZE == 0);
        (
            (start - self.area_start) / WORD_SIZE,
            (end - self.area_start) / WORD_SIZE,
        )
    }
}
