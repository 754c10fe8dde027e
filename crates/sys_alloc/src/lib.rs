//! OS memory provider for the heap: reserve address space once, then commit,
//! uncommit and pretouch page-aligned sub-ranges of it.

use std::io;
use std::ptr;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is typically the system page size.
/// Reservation alignments smaller than this are rounded up.
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

/// A reserved, initially inaccessible range of virtual address space.
///
/// The whole range is released when this handle is dropped.
pub struct Reservation {
    inner: os::ReservationInner,
}

impl Reservation {
    /// Returns a pointer to the start of the reservation.
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the reservation in bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the reservation is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    fn check_range(&self, offset: usize, len: usize) -> io::Result<()> {
        let page = page_size();
        let end = offset.checked_add(len);
        if offset % page != 0 || len % page != 0 || end.map_or(true, |end| end > self.len()) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "range must be page aligned and inside the reservation",
            ));
        }
        Ok(())
    }

    /// Backs `[offset, offset + len)` with readable, writable, zeroed memory.
    ///
    /// # Errors
    ///
    /// Fails if the range is not page aligned or the OS refuses the commit.
    pub fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        self.check_range(offset, len)?;
        // SAFETY: the range was checked to lie inside the reservation.
        unsafe { self.inner.commit(offset, len) }
    }

    /// Returns the pages of `[offset, offset + len)` to the OS. The range
    /// stays reserved and reads as zero after the next commit.
    ///
    /// # Errors
    ///
    /// Fails if the range is not page aligned or the OS refuses the request.
    ///
    /// # Safety
    ///
    /// No live data may remain in the range; any access before the next
    /// `commit` faults.
    pub unsafe fn uncommit(&self, offset: usize, len: usize) -> io::Result<()> {
        self.check_range(offset, len)?;
        unsafe { self.inner.uncommit(offset, len) }
    }

    /// Touches every page of a committed range so later accesses do not
    /// take page faults.
    ///
    /// # Safety
    ///
    /// The range must be committed.
    pub unsafe fn pretouch(&self, offset: usize, len: usize) {
        let page = page_size();
        let base = self.ptr();
        let mut cursor = offset;
        while cursor < offset + len {
            unsafe {
                let p = base.add(cursor);
                ptr::write_volatile(p, ptr::read_volatile(p));
            }
            cursor += page;
        }
    }
}

unsafe impl Send for Reservation {}
unsafe impl Sync for Reservation {}

/// Configuration for reserving address space.
#[derive(Debug, Clone)]
pub struct ReserveOptions {
    len: usize,
    align: usize,
}

impl ReserveOptions {
    /// Creates options with length 0 and page alignment.
    /// You must set a length before reserving.
    pub fn new() -> Self {
        Self {
            len: 0,
            align: allocation_granularity(),
        }
    }

    /// Sets the length of the reservation in bytes.
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Sets the required alignment of the reservation start.
    ///
    /// Must be a power of two; values below the allocation granularity are
    /// rounded up to it.
    pub fn align(mut self, align: usize) -> Self {
        self.align = align.max(allocation_granularity());
        self
    }

    /// Reserves the address range.
    ///
    /// # Errors
    ///
    /// Fails on zero or unaligned length, a non power of two alignment, or
    /// when the OS cannot provide the address space.
    pub fn reserve(&self) -> io::Result<Reservation> {
        if self.len == 0 || self.len % page_size() != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be a non-zero multiple of the page size",
            ));
        }
        if !self.align.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "alignment must be a power of two",
            ));
        }

        // SAFETY: alignment was validated above and is at least a page.
        let inner = unsafe { os::ReservationInner::reserve(self.len, self.align)? };
        Ok(Reservation { inner })
    }
}

impl Default for ReserveOptions {
    fn default() -> Self {
        Self::new()
    }
}
