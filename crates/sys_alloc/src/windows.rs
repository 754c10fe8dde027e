use std::io::{self, Error};
use std::mem;
use std::ptr;

#[cfg(not(miri))]
use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
};
#[cfg(not(miri))]
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

/// Returns the system allocation granularity.
///
/// On Windows, `VirtualAlloc` address must be aligned to this value (typically 64KB),
/// which is often larger than the page size (typically 4KB).
pub fn allocation_granularity() -> usize {
    #[cfg(miri)]
    {
        65536
    }
    #[cfg(not(miri))]
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let gran = info.dwAllocationGranularity as usize;
        if gran == 0 {
            65536
        } else {
            gran
        }
    }
}

pub fn page_size() -> usize {
    #[cfg(miri)]
    {
        4096
    }
    #[cfg(not(miri))]
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let size = info.dwPageSize as usize;
        if size == 0 {
            4096
        } else {
            size
        }
    }
}

const RESERVE_ATTEMPTS: usize = 8;

pub struct ReservationInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
    #[cfg(miri)]
    align: usize,
}

impl ReservationInner {
    /// Reserves `len` bytes of address space aligned to `align`.
    ///
    /// Windows cannot release part of a reservation, so an oversized range
    /// is reserved to find an aligned address, released, and then the
    /// aligned range is reserved exactly. Another thread may grab the range
    /// in between, hence the retry loop.
    pub unsafe fn reserve(len: usize, align: usize) -> io::Result<Self> {
        #[cfg(miri)]
        {
            use std::alloc::{alloc_zeroed, Layout};
            let layout = Layout::from_size_align(len, align)
                .map_err(|_| Error::from(io::ErrorKind::InvalidInput))?;
            let ptr = unsafe { alloc_zeroed(layout) };
            if ptr.is_null() {
                return Err(Error::from(io::ErrorKind::OutOfMemory));
            }
            Ok(Self {
                ptr: ptr.cast::<std::ffi::c_void>(),
                len,
                align,
            })
        }
        #[cfg(not(miri))]
        {
            let padded = len
                .checked_add(align)
                .ok_or_else(|| Error::from(io::ErrorKind::InvalidInput))?;
            for _ in 0..RESERVE_ATTEMPTS {
                let probe = unsafe { VirtualAlloc(ptr::null(), padded, MEM_RESERVE, PAGE_READWRITE) };
                if probe.is_null() {
                    return Err(Error::last_os_error());
                }
                let aligned = (probe as usize + align - 1) & !(align - 1);
                unsafe {
                    VirtualFree(probe, 0, MEM_RELEASE);
                }
                let ptr = unsafe {
                    VirtualAlloc(
                        aligned as *const std::ffi::c_void,
                        len,
                        MEM_RESERVE,
                        PAGE_READWRITE,
                    )
                };
                if !ptr.is_null() {
                    return Ok(Self { ptr, len });
                }
            }
            Err(Error::from(io::ErrorKind::AddrInUse))
        }
    }

    pub unsafe fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        #[cfg(miri)]
        {
            let _ = (offset, len);
            Ok(())
        }
        #[cfg(not(miri))]
        {
            let addr = unsafe { self.ptr.cast::<u8>().add(offset) };
            let ptr = unsafe {
                VirtualAlloc(addr.cast::<std::ffi::c_void>(), len, MEM_COMMIT, PAGE_READWRITE)
            };
            if ptr.is_null() {
                return Err(Error::last_os_error());
            }
            Ok(())
        }
    }

    pub unsafe fn uncommit(&self, offset: usize, len: usize) -> io::Result<()> {
        #[cfg(miri)]
        {
            unsafe { ptr::write_bytes(self.ptr.cast::<u8>().add(offset), 0, len) };
            Ok(())
        }
        #[cfg(not(miri))]
        {
            let addr = unsafe { self.ptr.cast::<u8>().add(offset) };
            let ok = unsafe { VirtualFree(addr.cast::<std::ffi::c_void>(), len, MEM_DECOMMIT) };
            if ok == 0 {
                return Err(Error::last_os_error());
            }
            Ok(())
        }
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for ReservationInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                #[cfg(miri)]
                {
                    use std::alloc::{dealloc, Layout};
                    if let Ok(layout) = Layout::from_size_align(self.len, self.align) {
                        dealloc(self.ptr.cast::<u8>(), layout);
                    }
                }
                #[cfg(not(miri))]
                {
                    // MEM_RELEASE requires dwSize to be 0
                    VirtualFree(self.ptr, 0, MEM_RELEASE);
                }
            }
        }
    }
}

unsafe impl Send for ReservationInner {}
unsafe impl Sync for ReservationInner {}
