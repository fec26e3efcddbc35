//! Virtual memory reservations for managed heap regions.
//!
//! A [`Reservation`] is a zero-initialised, read-write range of address space
//! whose start is aligned to a caller-chosen power of two. The heap carves
//! its pages out of a single reservation so that page metadata can be found
//! from any interior address with plain arithmetic.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the granularity at which the OS hands out address space.
///
/// On Windows, this is typically 64KB. On Unix, this is the system page size.
#[must_use]
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// An aligned range of reserved, committed address space.
///
/// The underlying mapping is released when this handle is dropped.
pub struct Reservation {
    mapping: os::Mapping,
    base: usize,
    len: usize,
}

impl Reservation {
    /// Reserves `len` bytes aligned to the system allocation granularity.
    ///
    /// # Errors
    ///
    /// Returns an error if `len` is zero or the OS refuses the mapping.
    pub fn new(len: usize) -> io::Result<Self> {
        ReserveOptions::new().len(len).reserve()
    }

    /// First usable address.
    #[must_use]
    pub const fn base(&self) -> usize {
        self.base
    }

    /// One past the last usable address.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.base + self.len
    }

    /// Usable length in bytes (excludes alignment slack).
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Always false; zero-length reservations are rejected at creation.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `addr` lies in `[base, end)`.
    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.len
    }

    /// Bytes actually mapped, including the slack used to reach alignment.
    #[must_use]
    pub fn mapped_len(&self) -> usize {
        self.mapping.len()
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("base", &format_args!("{:#x}", self.base))
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

/// Options for creating a [`Reservation`].
#[derive(Debug, Clone)]
pub struct ReserveOptions {
    len: usize,
    alignment: usize,
    no_reserve: bool,
}

impl ReserveOptions {
    /// Creates options with length 0 and granularity alignment.
    #[must_use]
    pub fn new() -> Self {
        Self {
            len: 0,
            alignment: allocation_granularity(),
            no_reserve: true,
        }
    }

    /// Sets the usable length in bytes.
    #[must_use]
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Sets the alignment of the first usable address.
    ///
    /// Values below the allocation granularity are raised to it. Non powers
    /// of two are rejected by [`ReserveOptions::reserve`].
    #[must_use]
    pub const fn alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Whether to skip swap reservation for the mapping (`MAP_NORESERVE`).
    ///
    /// Defaults to true: heap reservations are large and touched lazily.
    #[must_use]
    pub const fn no_reserve(mut self, no_reserve: bool) -> Self {
        self.no_reserve = no_reserve;
        self
    }

    /// Maps the reservation.
    ///
    /// The mapping is over-sized by `alignment` so that an aligned start can
    /// always be found inside it; the slack stays mapped but unused.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for a zero length or a non power-of-two
    /// alignment, or the OS error if the mapping fails.
    pub fn reserve(&self) -> io::Result<Reservation> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "reservation length must be greater than 0",
            ));
        }
        if !self.alignment.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "reservation alignment must be a power of two",
            ));
        }

        let alignment = self.alignment.max(allocation_granularity());
        let len = round_up(self.len, page_size());
        let mapped_len = len.checked_add(alignment).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "reservation length overflows")
        })?;

        // SAFETY: a fresh anonymous mapping aliases nothing.
        let mapping = unsafe { os::Mapping::map(mapped_len, self.no_reserve)? };
        let base = round_up(mapping.ptr() as usize, alignment);
        debug_assert!(base + len <= mapping.ptr() as usize + mapping.len());

        Ok(Reservation { mapping, base, len })
    }
}

impl Default for ReserveOptions {
    fn default() -> Self {
        Self::new()
    }
}

const fn round_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn test_page_size() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0, "Page size should be power of 2");
    }

    #[test]
    fn test_allocation_granularity() {
        let ag = allocation_granularity();
        assert!(ag >= page_size());
        assert!(ag.is_power_of_two());
    }

    #[test]
    fn test_reservation_is_writable_and_zeroed() {
        let reservation = Reservation::new(4 * page_size()).expect("failed to reserve");
        let base = reservation.base() as *mut u64;

        unsafe {
            assert_eq!(ptr::read_volatile(base), 0);
            ptr::write_volatile(base, 0xdead_beef);
            assert_eq!(ptr::read_volatile(base), 0xdead_beef);

            let last = (reservation.end() - 8) as *mut u64;
            ptr::write_volatile(last, 7);
            assert_eq!(ptr::read_volatile(last), 7);
        }
    }

    #[test]
    fn test_aligned_reservation() {
        let alignment = 256 * 1024;
        let reservation = ReserveOptions::new()
            .len(alignment * 2)
            .alignment(alignment)
            .reserve()
            .expect("failed to reserve");

        assert_eq!(reservation.base() % alignment, 0);
        assert_eq!(reservation.len(), alignment * 2);
        assert!(reservation.mapped_len() >= reservation.len() + alignment);
        assert!(reservation.contains(reservation.base()));
        assert!(!reservation.contains(reservation.end()));
    }

    #[test]
    fn test_rejects_zero_length() {
        let err = ReserveOptions::new().reserve().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_rejects_bad_alignment() {
        let err = ReserveOptions::new()
            .len(page_size())
            .alignment(3 * 4096)
            .reserve()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
