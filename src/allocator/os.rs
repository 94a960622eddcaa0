//! OS memory acquisition - page-granular anonymous mappings
//!
//! Design: Direct mmap/VirtualAlloc, no libc heap involvement, so regions
//! handed to spawned threads never share allocator state with the creator.

use crate::error::OsError;
use core::ptr::NonNull;
use once_cell::sync::Lazy;

static PAGE_SIZE: Lazy<usize> = Lazy::new(query_page_size);

/// Platform allocation granularity for anonymous regions
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Round `size` up to a whole number of pages (0 stays 0)
#[inline]
pub fn round_to_pages(size: usize) -> usize {
    let page = page_size();
    size.saturating_add(page - 1) & !(page - 1)
}

#[cfg(unix)]
fn query_page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

#[cfg(windows)]
fn query_page_size() -> usize {
    use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};

    let mut info: SYSTEM_INFO = unsafe { core::mem::zeroed() };
    unsafe { GetSystemInfo(&mut info) };
    info.dwPageSize as usize
}

/// Reserve and commit `size` bytes of zeroed read/write memory
#[cfg(unix)]
pub fn reserve(size: usize) -> Result<NonNull<u8>, OsError> {
    #[cfg(target_os = "linux")]
    const FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
    #[cfg(not(target_os = "linux"))]
    const FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON;

    let ptr = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            FLAGS,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        Err(OsError::last())
    } else {
        NonNull::new(ptr as *mut u8).ok_or(OsError::from_raw(libc::ENOMEM))
    }
}

#[cfg(windows)]
pub fn reserve(size: usize) -> Result<NonNull<u8>, OsError> {
    use winapi::um::memoryapi::VirtualAlloc;
    use winapi::um::winnt::{MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE};

    let ptr = unsafe {
        VirtualAlloc(core::ptr::null_mut(), size, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE)
    };
    NonNull::new(ptr as *mut u8).ok_or_else(OsError::last)
}

/// Return a region obtained from [`reserve`]
///
/// # Safety
/// `ptr`/`size` must describe exactly one live reservation.
#[cfg(unix)]
pub unsafe fn release(ptr: NonNull<u8>, size: usize) {
    libc::munmap(ptr.as_ptr().cast(), size);
}

#[cfg(windows)]
pub unsafe fn release(ptr: NonNull<u8>, _size: usize) {
    use winapi::um::memoryapi::VirtualFree;
    use winapi::um::winnt::MEM_RELEASE;

    VirtualFree(ptr.as_ptr().cast(), 0, MEM_RELEASE);
}

/// Make a page range inaccessible (stack guard)
///
/// # Safety
/// The range must be page aligned and inside a live reservation.
#[cfg(unix)]
pub unsafe fn protect_none(ptr: NonNull<u8>, size: usize) -> Result<(), OsError> {
    if libc::mprotect(ptr.as_ptr().cast(), size, libc::PROT_NONE) == 0 {
        Ok(())
    } else {
        Err(OsError::last())
    }
}
