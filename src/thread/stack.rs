//! Native stack regions and control-block placement
//!
//! Layout on Linux (addresses grow to the right):
//!
//! ```text
//! [ guard page | stack ............ [control block] | storage ...... ]
//!                ^ stack_lo          ^ initial sp    ^ storage start
//! ```
//!
//! The guard page is `PROT_NONE` so a runaway stack faults instead of
//! writing below the region.

use core::mem::{align_of, size_of};
use core::ptr::NonNull;

/// Where a typed record goes inside a byte range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(windows, allow(dead_code))]
pub(super) enum Placement {
    /// Highest aligned address that still fits (stack top, grows down below it)
    Top,
    /// Lowest aligned address
    Start,
}

/// Reinterpret part of a raw byte range as a `T`
///
/// This is the only place that turns stack or heap bytes into a typed
/// control-block handle; everything else works on the returned pointer.
///
/// # Safety
/// `[start, start + len)` must be writable and hold `size_of::<T>()` bytes
/// plus alignment slack.
pub(super) unsafe fn place<T>(start: *mut u8, len: usize, at: Placement) -> NonNull<T> {
    let align = align_of::<T>();
    let size = size_of::<T>();
    debug_assert!(len >= size + align, "range too small for placement");

    let base = start as usize;
    let addr = match at {
        Placement::Top => (base + len - size) & !(align - 1),
        Placement::Start => (base + align - 1) & !(align - 1),
    };
    NonNull::new_unchecked(start.add(addr - base) as *mut T)
}

#[cfg(target_os = "linux")]
pub(super) use region::StackRegion;

#[cfg(target_os = "linux")]
mod region {
    use crate::allocator::os;
    use crate::error::OsError;
    use core::ptr::NonNull;

    /// One mmap'd block: guard page, call stack, storage tail
    pub(in crate::thread) struct StackRegion {
        base: NonNull<u8>,
        len: usize,
        guard: usize,
        stack_size: usize,
        storage_size: usize,
    }

    impl StackRegion {
        /// Reserve a region for page-rounded `stack_size` + `storage_size`
        pub fn reserve(stack_size: usize, storage_size: usize) -> Result<Self, OsError> {
            let guard = os::page_size();
            let len = guard
                .checked_add(stack_size)
                .and_then(|n| n.checked_add(storage_size))
                .ok_or(OsError::from_raw(libc::ENOMEM))?;

            let base = os::reserve(len)?;
            if let Err(e) = unsafe { os::protect_none(base, guard) } {
                unsafe { os::release(base, len) };
                return Err(e);
            }

            Ok(Self {
                base,
                len,
                guard,
                stack_size,
                storage_size,
            })
        }

        /// Lowest stack address and stack length
        #[inline]
        pub fn stack(&self) -> (*mut u8, usize) {
            (unsafe { self.base.as_ptr().add(self.guard) }, self.stack_size)
        }

        /// Storage tail right above the stack
        #[inline]
        pub fn storage(&self) -> (NonNull<u8>, usize) {
            let start = unsafe { self.base.as_ptr().add(self.guard + self.stack_size) };
            // Safety: offset into a non-null mapping
            (unsafe { NonNull::new_unchecked(start) }, self.storage_size)
        }

        #[inline]
        pub fn fits(&self, stack_size: usize, storage_size: usize) -> bool {
            self.stack_size == stack_size && self.storage_size == storage_size
        }

        #[cfg(test)]
        pub fn len(&self) -> usize {
            self.len
        }
    }

    impl Drop for StackRegion {
        fn drop(&mut self) {
            unsafe { os::release(self.base, self.len) };
        }
    }
}
