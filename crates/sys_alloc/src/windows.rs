use std::io::{self, Error};
use std::mem;
use std::ptr;

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

fn system_info() -> SYSTEM_INFO {
    // SAFETY: GetSystemInfo fills the zeroed struct and cannot fail.
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        info
    }
}

/// Returns the system allocation granularity (typically 64KB).
pub fn allocation_granularity() -> usize {
    match system_info().dwAllocationGranularity as usize {
        0 => 65536,
        gran => gran,
    }
}

pub fn page_size() -> usize {
    match system_info().dwPageSize as usize {
        0 => 4096,
        size => size,
    }
}

pub struct Mapping {
    ptr: *mut std::ffi::c_void,
    len: usize,
}

impl Mapping {
    /// Reserves and commits `len` bytes of read-write memory.
    ///
    /// # Safety
    ///
    /// Calls `VirtualAlloc`; the caller owns the returned range exclusively.
    pub unsafe fn map(len: usize, _no_reserve: bool) -> io::Result<Self> {
        // SAFETY: no address hint; the OS picks a free range.
        let ptr = unsafe { VirtualAlloc(ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
        if ptr.is_null() {
            return Err(Error::last_os_error());
        }
        Ok(Self { ptr, len })
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: MEM_RELEASE requires dwSize to be 0 and the base returned
        // by VirtualAlloc.
        unsafe {
            VirtualFree(self.ptr, 0, MEM_RELEASE);
        }
    }
}

// SAFETY: see the Unix implementation.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}
