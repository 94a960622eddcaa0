//! Program context - per-thread configuration bundle
//!
//! Each OS thread has exactly one current context. Threads created by the OS
//! or by `std` get a lazily initialised thread-local default. Runtime
//! threads get the copy placed in their own storage by `Thread::create`,
//! found through the stack registry because a raw kernel thread shares its
//! creator's TLS register.
//!
//! Nothing in this module allocates or logs.

use crate::allocator::Allocator;
use core::cell::{Cell, UnsafeCell};
use core::ptr::{self, NonNull};

/// Thread configuration bundle
#[derive(Debug, Clone, Copy)]
pub struct Context {
    /// Default allocator for code running on this thread
    pub allocator: Allocator,
}

impl Context {
    /// Seed for the first access on a new OS thread
    pub const DEFAULT: Context = Context {
        allocator: Allocator::heap(),
    };
}

impl Default for Context {
    fn default() -> Self {
        Self::DEFAULT
    }
}

thread_local! {
    static DEFAULT_CONTEXT: UnsafeCell<Context> = const { UnsafeCell::new(Context::DEFAULT) };
    static CURRENT: Cell<*mut Context> = const { Cell::new(ptr::null_mut()) };
}

/// The calling thread's current context; never null
pub fn current() -> NonNull<Context> {
    #[cfg(target_os = "linux")]
    if let Some(slot) = crate::thread::runtime_context_slot() {
        if let Some(ctx) = NonNull::new(slot.load(core::sync::atomic::Ordering::Acquire)) {
            return ctx;
        }
    }

    CURRENT.with(|current| match NonNull::new(current.get()) {
        Some(ctx) => ctx,
        None => {
            let ctx = DEFAULT_CONTEXT.with(|d| d.get());
            current.set(ctx);
            // Safety: thread-local storage is never null
            unsafe { NonNull::new_unchecked(ctx) }
        }
    })
}

/// Replace the calling thread's current context, returning the previous one
///
/// Callers restore the previous pointer when their scope ends (or use
/// [`ContextGuard`]).
///
/// # Safety
/// `next` must stay valid until it is replaced again on this thread.
pub unsafe fn set_current(next: NonNull<Context>) -> NonNull<Context> {
    #[cfg(target_os = "linux")]
    if let Some(slot) = crate::thread::runtime_context_slot() {
        let prev = slot.swap(next.as_ptr(), core::sync::atomic::Ordering::AcqRel);
        if let Some(prev) = NonNull::new(prev) {
            return prev;
        }
    }

    let prev = current();
    CURRENT.with(|current| current.set(next.as_ptr()));
    prev
}

/// Allocator of the calling thread's current context
#[inline]
pub fn allocator() -> Allocator {
    unsafe { current().as_ref().allocator }
}

/// RAII guard for a scoped context override
///
/// Usage:
/// ```ignore
/// let mut ctx = Context { allocator: arena.allocator() };
/// let _guard = unsafe { ContextGuard::new(NonNull::from(&mut ctx)) };
/// // current() is &ctx until _guard drops
/// ```
pub struct ContextGuard {
    prev: NonNull<Context>,
}

impl ContextGuard {
    /// # Safety
    /// `next` must outlive the guard.
    #[inline]
    pub unsafe fn new(next: NonNull<Context>) -> Self {
        Self {
            prev: set_current(next),
        }
    }
}

impl Drop for ContextGuard {
    #[inline]
    fn drop(&mut self) {
        unsafe {
            set_current(self.prev);
        }
    }
}
