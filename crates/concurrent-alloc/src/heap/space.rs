//! The shared old-generation space.
//!
//! [`SharedSpace`] is the only heap structure touched by more than one
//! allocator: it hands out [`Slice`]s under its own lock and owns the page
//! metadata used for black-area bookkeeping. [`OldSpace`] is the production
//! implementation over a single `sys_alloc` reservation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use sys_alloc::{Reservation, ReserveOptions};

use crate::alloc::{Address, AllocationAlignment, AllocationOrigin};
use crate::error::HeapError;
use crate::heap::filler::{create_filler_object_at, filler_size_at, ONE_WORD_FILLER_MAGIC};
use crate::heap::{Page, PAGE_SIZE, WORD_SIZE};
use crate::local_heap::ThreadState;

/// A contiguous range granted to exactly one allocator.
///
/// Move-only: whoever holds the `Slice` owns the memory.
#[must_use]
#[derive(Debug, PartialEq, Eq)]
pub struct Slice {
    start: Address,
    size: usize,
}

impl Slice {
    /// Wrap a raw range.
    ///
    /// # Safety
    ///
    /// `[start, start + size)` must be writable heap memory that nobody else
    /// reads or writes until the returned value is consumed.
    pub unsafe fn new(start: Address, size: usize) -> Self {
        debug_assert!(start != 0, "null slice");
        debug_assert!(start.checked_add(size).is_some(), "slice wraps around");
        debug_assert!(
            start % WORD_SIZE == 0 && size % WORD_SIZE == 0,
            "slice {start:#x}+{size} is not word aligned"
        );
        Self { start, size }
    }

    /// First address of the slice.
    #[must_use]
    pub const fn start(&self) -> Address {
        self.start
    }

    /// Size in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// One past the last address.
    #[must_use]
    pub const fn end(&self) -> Address {
        self.start + self.size
    }

    /// Give up the `Slice` wrapper; the caller now owns the raw range.
    #[must_use]
    pub const fn into_raw_parts(self) -> (Address, usize) {
        (self.start, self.size)
    }
}

/// Slice provider shared by every allocator of a heap.
///
/// # Safety
///
/// Implementors must guarantee that every slice returned by
/// [`SharedSpace::request_slice`] is writable memory, lies inside a single
/// page reported by [`SharedSpace::page_for`], satisfies the requested
/// alignment at its start, and is disjoint from every other slice granted
/// and not yet reclaimed, even under concurrent calls.
pub unsafe trait SharedSpace: Send + Sync {
    /// Grant a slice of `min_size..=max_size` bytes, or `None` if the space
    /// is exhausted.
    fn request_slice(
        &self,
        requester: &ThreadState,
        min_size: usize,
        max_size: usize,
        alignment: AllocationAlignment,
        origin: AllocationOrigin,
    ) -> Option<Slice>;

    /// Metadata of the page containing `address`.
    fn page_for(&self, address: Address) -> Option<&Page>;

    /// Drop per-thread accounting for `requester`, which is going away.
    fn release_requester(&self, _requester: &ThreadState) {}

    /// Take back memory covered by fillers that are not marked black and
    /// return how many bytes became free.
    ///
    /// # Safety
    ///
    /// The world must be stopped and every LAB closed, so no thread owns
    /// memory the sweep could hand out again.
    unsafe fn sweep(&self) -> usize {
        0
    }
}

#[derive(Debug, Clone, Copy)]
struct FreeRange {
    start: Address,
    end: Address,
}

impl FreeRange {
    const fn len(self) -> usize {
        self.end - self.start
    }
}

#[derive(Debug, Default)]
struct FreeList {
    /// Searched from the back so the most recently split range is reused
    /// first, which keeps one thread's consecutive slices contiguous.
    ranges: Vec<FreeRange>,
    committed_pages: usize,
    outstanding: HashMap<usize, usize>,
}

/// Old-generation space backed by one aligned reservation.
pub struct OldSpace {
    reservation: Reservation,
    pages: Box<[Page]>,
    free_list: Mutex<FreeList>,
    granted_bytes: AtomicUsize,
}

impl OldSpace {
    /// Reserve `reservation_size` bytes (a multiple of [`PAGE_SIZE`]).
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::InvalidConfig`] for a bad size and
    /// [`HeapError::Reservation`] if the OS refuses the mapping.
    pub fn new(reservation_size: usize) -> Result<Self, HeapError> {
        if reservation_size == 0 || reservation_size % PAGE_SIZE != 0 {
            return Err(HeapError::InvalidConfig(format!(
                "reservation size {reservation_size} is not a non-zero multiple of {PAGE_SIZE}"
            )));
        }

        let reservation = ReserveOptions::new()
            .len(reservation_size)
            .alignment(PAGE_SIZE)
            .reserve()
            .map_err(|source| HeapError::Reservation {
                size: reservation_size,
                source,
            })?;

        let base = reservation.base();
        let pages = (0..reservation_size / PAGE_SIZE)
            .map(|i| Page::new(base + i * PAGE_SIZE, PAGE_SIZE))
            .collect();

        Ok(Self {
            reservation,
            pages,
            free_list: Mutex::new(FreeList::default()),
            granted_bytes: AtomicUsize::new(0),
        })
    }

    /// Total bytes the space can ever grant.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.reservation.len()
    }

    /// Number of pages in the reservation.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Pages that have been put on the free list so far.
    #[must_use]
    pub fn committed_pages(&self) -> usize {
        self.free_list.lock().committed_pages
    }

    /// Bytes granted to allocators so far, alignment fill included.
    #[must_use]
    pub fn granted_bytes(&self) -> usize {
        self.granted_bytes.load(Ordering::Relaxed)
    }

    /// Bytes granted to the thread with id `thread_id`.
    #[must_use]
    pub fn outstanding_bytes(&self, thread_id: usize) -> usize {
        self.free_list
            .lock()
            .outstanding
            .get(&thread_id)
            .copied()
            .unwrap_or(0)
    }

    /// Bytes currently on the free list.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.free_list
            .lock()
            .ranges
            .iter()
            .map(|range| range.len())
            .sum()
    }

    /// Iterate over committed pages.
    pub fn committed(&self) -> impl Iterator<Item = &Page> + '_ {
        let committed = self.committed_pages();
        self.pages[..committed].iter()
    }

    fn commit_page(&self, list: &mut FreeList) -> bool {
        let Some(page) = self.pages.get(list.committed_pages) else {
            return false;
        };
        let range = FreeRange {
            start: page.area_start(),
            end: page.area_end(),
        };
        // SAFETY: a freshly committed page is owned by the free list.
        unsafe { create_filler_object_at(range.start, range.len()) };
        list.ranges.push(range);
        list.committed_pages += 1;
        true
    }

    fn take(
        list: &mut FreeList,
        min_size: usize,
        max_size: usize,
        alignment: AllocationAlignment,
    ) -> Option<(Address, usize, usize)> {
        let index = list.ranges.iter().rposition(|range| {
            range.len() >= alignment.fill_to_align(range.start) + min_size
        })?;

        let range = &mut list.ranges[index];
        let fill = alignment.fill_to_align(range.start);
        let start = range.start + fill;
        let size = (range.end - start).min(max_size);

        // SAFETY: the whole range belongs to the free list until handed out.
        unsafe { create_filler_object_at(range.start, fill) };
        range.start = start + size;

        if range.start == range.end {
            list.ranges.remove(index);
        } else {
            // SAFETY: as above, for the remainder.
            unsafe { create_filler_object_at(range.start, range.len()) };
        }
        Some((start, size, fill))
    }
}

// SAFETY: ranges come from the reservation, never cross a page (each page is
// added as its own range), are aligned by `take`, and are removed from the
// free list under the lock before being returned.
unsafe impl SharedSpace for OldSpace {
    fn request_slice(
        &self,
        requester: &ThreadState,
        min_size: usize,
        max_size: usize,
        alignment: AllocationAlignment,
        origin: AllocationOrigin,
    ) -> Option<Slice> {
        debug_assert!(min_size > 0 && min_size <= max_size);
        debug_assert!(
            min_size + alignment.max_fill() <= PAGE_SIZE,
            "slice of {min_size} bytes can never fit a page"
        );

        let mut list = self.free_list.lock();
        let (start, size, fill) = loop {
            if let Some(grant) = Self::take(&mut list, min_size, max_size, alignment) {
                break grant;
            }
            if !self.commit_page(&mut list) {
                drop(list);
                crate::tracing::internal::log_space_exhausted(requester.id(), min_size, origin);
                return None;
            }
        };
        *list.outstanding.entry(requester.id()).or_insert(0) += size + fill;
        drop(list);

        self.granted_bytes.fetch_add(size + fill, Ordering::Relaxed);
        crate::tracing::internal::log_slice_granted(requester.id(), start, size, origin);

        // SAFETY: removed from the free list above; see the impl comment.
        Some(unsafe { Slice::new(start, size) })
    }

    fn page_for(&self, address: Address) -> Option<&Page> {
        if !self.reservation.contains(address) {
            return None;
        }
        self.pages
            .get((address - self.reservation.base()) / PAGE_SIZE)
    }

    fn release_requester(&self, requester: &ThreadState) {
        self.free_list.lock().outstanding.remove(&requester.id());
    }

    unsafe fn sweep(&self) -> usize {
        let mut list = self.free_list.lock();
        let before: usize = list.ranges.iter().map(|range| range.len()).sum();

        // Rebuild the free list page by page; a page that cannot be walked
        // keeps the ranges it had.
        let mut ranges = Vec::with_capacity(list.ranges.len());
        for page in &self.pages[..list.committed_pages] {
            // SAFETY: committed pages are mapped and the world is stopped.
            match unsafe { sweep_page(page) } {
                Some(free) => ranges.extend(free),
                None => ranges.extend(
                    list.ranges
                        .iter()
                        .copied()
                        .filter(|range| page.contains(range.start)),
                ),
            }
        }

        let after: usize = ranges.iter().map(|range| range.len()).sum();
        list.ranges = ranges;
        after.saturating_sub(before)
    }
}

/// The free ranges of `page`, or `None` if it holds anything but fillers.
///
/// Runs of fillers that are not marked black become free ranges, each
/// covered by a single filler again.
///
/// # Safety
///
/// The page area must be mapped and nobody else may access it meanwhile.
unsafe fn sweep_page(page: &Page) -> Option<Vec<FreeRange>> {
    let end = page.area_end();
    let mut free = Vec::new();
    let mut run_start = None;
    let mut address = page.area_start();

    while address < end {
        let size = if end - address == WORD_SIZE {
            // SAFETY: the last word of the page is mapped.
            let word = unsafe { (address as *const usize).read() };
            (word == ONE_WORD_FILLER_MAGIC).then_some(WORD_SIZE)
        } else {
            // SAFETY: at least two words of the page remain.
            unsafe { filler_size_at(address) }
        }?;
        if size == 0 || size % WORD_SIZE != 0 || size > end - address {
            return None;
        }

        if page.is_black(address) {
            if let Some(start) = run_start.take() {
                free.push(FreeRange { start, end: address });
            }
        } else if run_start.is_none() {
            run_start = Some(address);
        }
        address += size;
    }
    if let Some(start) = run_start {
        free.push(FreeRange { start, end });
    }

    for range in &free {
        // SAFETY: the range held only unmarked fillers.
        unsafe { create_filler_object_at(range.start, range.len()) };
    }
    Some(free)
}

impl std::fmt::Debug for OldSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OldSpace")
            .field("reservation", &self.reservation)
            .field("pages", &self.pages.len())
            .field("granted_bytes", &self.granted_bytes())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread() -> ThreadState {
        ThreadState::new(1)
    }

    #[test]
    fn test_consecutive_requests_are_contiguous() {
        let space = OldSpace::new(PAGE_SIZE).unwrap();
        let t = thread();
        let a = space
            .request_slice(&t, 4096, 4096, AllocationAlignment::Word, AllocationOrigin::Runtime)
            .unwrap();
        let b = space
            .request_slice(&t, 4096, 4096, AllocationAlignment::Word, AllocationOrigin::Runtime)
            .unwrap();

        assert_eq!(a.end(), b.start());
        assert_eq!(space.granted_bytes(), 8192);
        assert_eq!(space.outstanding_bytes(1), 8192);
    }

    #[test]
    fn test_slice_size_is_clamped_to_max() {
        let space = OldSpace::new(PAGE_SIZE).unwrap();
        let slice = space
            .request_slice(&thread(), 64, 1024, AllocationAlignment::Word, AllocationOrigin::Gc)
            .unwrap();
        assert_eq!(slice.size(), 1024);
    }

    #[test]
    fn test_remainder_stays_iterable() {
        let space = OldSpace::new(PAGE_SIZE).unwrap();
        let slice = space
            .request_slice(&thread(), 1024, 1024, AllocationAlignment::Word, AllocationOrigin::Runtime)
            .unwrap();
        let size = unsafe { filler_size_at(slice.end()) };
        assert_eq!(size, Some(PAGE_SIZE - 1024));
    }

    #[test]
    fn test_alignment_fill_becomes_filler() {
        let space = OldSpace::new(PAGE_SIZE).unwrap();
        let t = thread();
        let first = space
            .request_slice(&t, WORD_SIZE, WORD_SIZE, AllocationAlignment::Word, AllocationOrigin::Runtime)
            .unwrap();
        let aligned = space
            .request_slice(
                &t,
                4 * WORD_SIZE,
                4 * WORD_SIZE,
                AllocationAlignment::DoubleAligned,
                AllocationOrigin::Runtime,
            )
            .unwrap();

        assert_eq!(AllocationAlignment::DoubleAligned.fill_to_align(aligned.start()), 0);
        assert_eq!(aligned.start(), first.end() + WORD_SIZE);
        assert_eq!(unsafe { filler_size_at(first.end()) }, Some(WORD_SIZE));
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let space = OldSpace::new(PAGE_SIZE).unwrap();
        let t = thread();
        let whole = space
            .request_slice(&t, PAGE_SIZE, PAGE_SIZE, AllocationAlignment::Word, AllocationOrigin::Runtime)
            .unwrap();
        assert_eq!(whole.size(), PAGE_SIZE);
        assert!(space
            .request_slice(&t, WORD_SIZE, WORD_SIZE, AllocationAlignment::Word, AllocationOrigin::Runtime)
            .is_none());
    }

    #[test]
    fn test_commits_pages_lazily() {
        let space = OldSpace::new(4 * PAGE_SIZE).unwrap();
        assert_eq!(space.committed_pages(), 0);
        let t = thread();
        let _a = space
            .request_slice(&t, PAGE_SIZE, PAGE_SIZE, AllocationAlignment::Word, AllocationOrigin::Runtime)
            .unwrap();
        let _b = space
            .request_slice(&t, 64, 64, AllocationAlignment::Word, AllocationOrigin::Runtime)
            .unwrap();
        assert_eq!(space.committed_pages(), 2);
    }

    #[test]
    fn test_page_for() {
        let space = OldSpace::new(2 * PAGE_SIZE).unwrap();
        let slice = space
            .request_slice(&thread(), 64, 64, AllocationAlignment::Word, AllocationOrigin::Runtime)
            .unwrap();
        let page = space.page_for(slice.start()).unwrap();
        assert!(page.contains(slice.start()));
        assert!(space.page_for(0).is_none());
    }

    #[test]
    fn test_release_requester_forgets_thread() {
        let space = OldSpace::new(PAGE_SIZE).unwrap();
        let t = thread();
        let _slice = space
            .request_slice(&t, 64, 64, AllocationAlignment::Word, AllocationOrigin::Runtime)
            .unwrap();
        assert_eq!(space.outstanding_bytes(t.id()), 64);

        space.release_requester(&t);
        assert_eq!(space.outstanding_bytes(t.id()), 0);
        assert!(space.free_list.lock().outstanding.is_empty());
    }

    fn grant_filler(space: &OldSpace, t: &ThreadState, size: usize) -> Address {
        let (address, size) = space
            .request_slice(t, size, size, AllocationAlignment::Word, AllocationOrigin::Runtime)
            .unwrap()
            .into_raw_parts();
        unsafe { create_filler_object_at(address, size) };
        address
    }

    #[test]
    fn test_sweep_reclaims_unmarked_fillers() {
        let space = OldSpace::new(2 * PAGE_SIZE).unwrap();
        let t = thread();
        let dead = grant_filler(&space, &t, 1024);
        let live = grant_filler(&space, &t, 512);
        let dead_too = grant_filler(&space, &t, 256);
        space.page_for(live).unwrap().mark_black(live, 512);
        assert_eq!(space.free_bytes(), PAGE_SIZE - 1792);

        let reclaimed = unsafe { space.sweep() };

        assert_eq!(reclaimed, 1280);
        assert_eq!(space.free_bytes(), PAGE_SIZE - 512);
        assert_eq!(unsafe { filler_size_at(dead) }, Some(1024));
        assert_eq!(unsafe { filler_size_at(live) }, Some(512));
        assert_eq!(unsafe { filler_size_at(dead_too) }, Some(PAGE_SIZE - 1536));

        // Reclaimed memory is handed out again.
        assert_eq!(grant_filler(&space, &t, 1024), dead_too);
    }

    #[test]
    fn test_sweep_skips_pages_with_other_contents() {
        let space = OldSpace::new(PAGE_SIZE).unwrap();
        let t = thread();
        let (address, _) = space
            .request_slice(&t, 64, 64, AllocationAlignment::Word, AllocationOrigin::Runtime)
            .unwrap()
            .into_raw_parts();
        unsafe { (address as *mut usize).write(0xDEAD_BEEF) };
        let free = space.free_bytes();

        assert_eq!(unsafe { space.sweep() }, 0);
        assert_eq!(space.free_bytes(), free);
    }

    #[test]
    fn test_rejects_unaligned_reservation() {
        assert!(matches!(
            OldSpace::new(PAGE_SIZE + 1),
            Err(HeapError::InvalidConfig(_))
        ));
    }
}
