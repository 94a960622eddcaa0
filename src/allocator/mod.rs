//! Memory allocators - one call convention for every allocator
//!
//! Design: An `Allocator` is a plain `{alloc_fn, data}` pair. A single
//! function covers the whole lifecycle:
//! 1. `ptr == null`  - allocate `new_size` bytes
//! 2. `new_size == 0` - free `old_size` bytes at `ptr`
//! 3. otherwise       - reallocate from `old_size` to `new_size`
//!
//! Two implementations ship with the runtime: the process heap (default
//! context of OS-created threads) and the bump `Arena` embedded in every
//! runtime thread's storage.

mod arena;
pub(crate) mod os;


pub use arena::{arena_alloc, Arena, ARENA_ALIGN};
pub use os::page_size;

use core::ffi::c_void;
use core::ptr::{self, NonNull};
use std::alloc::Layout;

/// Unified allocate/free/realloc function
///
/// Returns null on every failure and on free.
pub type AllocFn = unsafe fn(data: *mut c_void, ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8;

/// Alignment guaranteed by the heap allocator
pub const HEAP_ALIGN: usize = 16;

/// Allocator handle - freely copyable value
#[derive(Clone, Copy)]
pub struct Allocator {
    pub alloc_fn: AllocFn,
    pub data: *mut c_void,
}

impl Allocator {
    /// Process heap allocator
    #[inline]
    pub const fn heap() -> Self {
        Self {
            alloc_fn: heap_alloc,
            data: ptr::null_mut(),
        }
    }

    /// Allocate `size` bytes
    #[inline]
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        NonNull::new(unsafe { (self.alloc_fn)(self.data, ptr::null_mut(), 0, size) })
    }

    /// Free an allocation of `size` bytes
    ///
    /// # Safety
    /// `ptr` must come from this allocator with exactly `size` bytes.
    #[inline]
    pub unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
        (self.alloc_fn)(self.data, ptr.as_ptr(), size, 0);
    }

    /// Resize an allocation; `None` leaves the original untouched
    ///
    /// # Safety
    /// `ptr` must come from this allocator with exactly `old_size` bytes.
    #[inline]
    pub unsafe fn realloc(&self, ptr: NonNull<u8>, old_size: usize, new_size: usize) -> Option<NonNull<u8>> {
        NonNull::new((self.alloc_fn)(self.data, ptr.as_ptr(), old_size, new_size))
    }

    /// Whether two handles dispatch to the same allocator instance
    #[inline]
    pub fn same_as(&self, other: &Allocator) -> bool {
        self.alloc_fn as usize == other.alloc_fn as usize && self.data == other.data
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Self::heap()
    }
}

impl core::fmt::Debug for Allocator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Allocator")
            .field("alloc_fn", &(self.alloc_fn as *const ()))
            .field("data", &self.data)
            .finish()
    }
}

/// [`AllocFn`] over the global Rust heap
///
/// # Safety
/// Non-null `ptr` must come from this function with exactly `old_size` bytes.
pub unsafe fn heap_alloc(_data: *mut c_void, ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8 {
    if new_size == 0 {
        if let Some(layout) = heap_layout(old_size) {
            if !ptr.is_null() {
                std::alloc::dealloc(ptr, layout);
            }
        }
        return ptr::null_mut();
    }

    if ptr.is_null() {
        return match heap_layout(new_size) {
            Some(layout) => std::alloc::alloc(layout),
            None => ptr::null_mut(),
        };
    }

    if old_size == new_size {
        return ptr;
    }

    match heap_layout(old_size) {
        Some(layout) if Layout::from_size_align(new_size, HEAP_ALIGN).is_ok() => {
            std::alloc::realloc(ptr, layout, new_size)
        }
        _ => ptr::null_mut(),
    }
}

#[inline]
fn heap_layout(size: usize) -> Option<Layout> {
    if size == 0 {
        return None;
    }
    Layout::from_size_align(size, HEAP_ALIGN).ok()
}
