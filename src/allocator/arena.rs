//! Arena - bump-pointer allocation over one fixed reserved region
//!
//! Design: `start` only moves forward on allocation and backward when the
//! most recent allocation is freed or shrunk. Frees of older allocations are
//! accepted fragmentation; the whole region comes back at once.
//!
//! Nothing here logs or touches thread-local state except `reserve`/`Drop`:
//! the embedded arena runs on bare runtime threads.

use super::os;
use super::Allocator;
use crate::error::OsError;
use core::ffi::c_void;
use core::ptr::{self, NonNull};

/// Alignment of every arena allocation
pub const ARENA_ALIGN: usize = 8;

/// Bump allocator over `[start, end)`
///
/// Owns its region when created with [`Arena::reserve`]; borrows it when
/// built over caller memory with [`Arena::from_raw_parts`].
pub struct Arena {
    start: *mut u8,
    end: *mut u8,
    /// First usable byte; `end - base` is the capacity
    base: *mut u8,
    /// Page-rounded mapping to unmap on release, `None` when borrowed
    mapping: Option<(NonNull<u8>, usize)>,
}

// Safety: an arena is only ever used by one thread at a time; ownership
// of the region moves with the value.
unsafe impl Send for Arena {}

impl Arena {
    /// Arena with no capacity
    #[inline]
    pub const fn empty() -> Self {
        Self {
            start: ptr::null_mut(),
            end: ptr::null_mut(),
            base: ptr::null_mut(),
            mapping: None,
        }
    }

    /// Reserve exactly `size` usable bytes from the OS
    ///
    /// The mapping itself is page-rounded; the slack past `size` is never
    /// handed out.
    pub fn reserve(size: usize) -> Result<Self, OsError> {
        let len = os::round_to_pages(size.max(1));
        let base = os::reserve(len)?;
        tracing::debug!(target: "arena", size_bytes = size, mapped_bytes = len, address = ?base, "arena reserved");

        Ok(Self {
            start: base.as_ptr(),
            end: unsafe { base.as_ptr().add(size) },
            base: base.as_ptr(),
            mapping: Some((base, len)),
        })
    }

    /// Arena over memory it does not own
    ///
    /// # Safety
    /// `[start, start + len)` must be writable and outlive every allocation
    /// made from this arena.
    #[inline]
    pub unsafe fn from_raw_parts(start: *mut u8, len: usize) -> Self {
        Self {
            start,
            end: start.add(len),
            base: start,
            mapping: None,
        }
    }

    /// Exact number of bytes left before padding
    #[inline]
    pub fn remaining(&self) -> usize {
        self.end as usize - self.start as usize
    }

    /// Total usable bytes, owned or borrowed
    #[inline]
    pub fn capacity(&self) -> usize {
        self.end as usize - self.base as usize
    }

    /// Bytes consumed so far, alignment padding included
    #[inline]
    pub fn used(&self) -> usize {
        self.start as usize - self.base as usize
    }

    /// Whether the arena has any memory behind it
    #[inline]
    pub fn is_reserved(&self) -> bool {
        !self.end.is_null()
    }

    /// Rewind to the first byte; every earlier allocation is invalidated
    #[inline]
    pub fn reset(&mut self) {
        self.start = self.base;
    }

    /// Whether this arena unmaps its region on release
    #[inline]
    pub fn is_owned(&self) -> bool {
        self.mapping.is_some()
    }

    /// Allocate `size` bytes aligned to [`ARENA_ALIGN`]
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 || self.start.is_null() {
            return None;
        }

        let padding = self.start.align_offset(ARENA_ALIGN);
        let remaining = self.remaining();
        if padding > remaining || remaining - padding < size {
            return None;
        }

        unsafe {
            let ptr = self.start.add(padding);
            self.start = ptr.add(size);
            NonNull::new(ptr)
        }
    }

    /// Give back `size` bytes at `ptr`; only the most recent allocation is reclaimed
    ///
    /// # Safety
    /// `ptr` must come from this arena with exactly `size` bytes.
    pub unsafe fn free(&mut self, ptr: *mut u8, size: usize) {
        if self.is_last(ptr, size) {
            self.start = ptr;
        }
    }

    /// Resize an allocation, growing or shrinking in place when it is the last one
    ///
    /// # Safety
    /// `ptr` must come from this arena with exactly `old_size` bytes.
    pub unsafe fn realloc(&mut self, ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8 {
        if old_size == new_size {
            return ptr;
        }

        if self.is_last(ptr, old_size) {
            if new_size > old_size {
                let grow = new_size - old_size;
                if grow > self.remaining() {
                    return ptr::null_mut();
                }
                self.start = self.start.add(grow);
            } else {
                self.start = self.start.sub(old_size - new_size);
            }
            return ptr;
        }

        // Older allocation: shrinking is a logical truncation only
        if new_size < old_size {
            return ptr;
        }

        match self.alloc(new_size) {
            Some(fresh) => {
                ptr::copy_nonoverlapping(ptr, fresh.as_ptr(), old_size);
                fresh.as_ptr()
            }
            None => ptr::null_mut(),
        }
    }

    /// Unified allocate/free/realloc entry (see [`super::AllocFn`])
    ///
    /// # Safety
    /// Same contract as [`Arena::realloc`] for non-null `ptr`.
    pub unsafe fn resize(&mut self, ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8 {
        if new_size == 0 {
            if !ptr.is_null() {
                self.free(ptr, old_size);
            }
            return ptr::null_mut();
        }

        if ptr.is_null() {
            return self.alloc(new_size).map_or(ptr::null_mut(), NonNull::as_ptr);
        }

        self.realloc(ptr, old_size, new_size)
    }

    /// Allocator view over this arena
    ///
    /// The arena must stay at its current address while the view is used.
    #[inline]
    pub fn allocator(&mut self) -> Allocator {
        Allocator {
            alloc_fn: arena_alloc,
            data: self as *mut Self as *mut c_void,
        }
    }

    /// Release an owned region (a borrowed one is only detached); the arena
    /// is empty afterwards
    pub fn release(&mut self) {
        if let Some((base, len)) = self.mapping.take() {
            unsafe { os::release(base, len) };
            tracing::debug!(target: "arena", size_bytes = len, address = ?base, "arena released");
        }
        self.start = ptr::null_mut();
        self.end = ptr::null_mut();
        self.base = ptr::null_mut();
    }

    #[inline]
    fn is_last(&self, ptr: *mut u8, size: usize) -> bool {
        !ptr.is_null() && ptr.wrapping_add(size) == self.start
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        self.release();
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::empty()
    }
}

/// [`super::AllocFn`] adapter: `data` is a `*mut Arena`
///
/// # Safety
/// `data` must point to a live arena used by no other thread.
pub unsafe fn arena_alloc(data: *mut c_void, ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8 {
    match (data as *mut Arena).as_mut() {
        Some(arena) => arena.resize(ptr, old_size, new_size),
        None => ptr::null_mut(),
    }
}
