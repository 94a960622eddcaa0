//! Windows backend - `CreateThread` with a heap-allocated control block
//!
//! The OS owns and sizes the stack; the control block and the storage tail
//! share one process-heap block. Windows threads get their own TLS, so the
//! trampoline installs the context through the ordinary thread-local slot.

use super::stack::{place, Placement};
use super::{State, ThreadProc};
use crate::allocator::Arena;
use crate::context::{self, Context};
use crate::error::{Error, OsError, Result};
use core::cell::UnsafeCell;
use core::ffi::c_void;
use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use winapi::shared::minwindef::{DWORD, LPVOID};
use winapi::shared::winerror::{ERROR_NOT_ENOUGH_MEMORY, WAIT_TIMEOUT};
use winapi::um::handleapi::CloseHandle;
use winapi::um::heapapi::{GetProcessHeap, HeapAlloc, HeapFree};
use winapi::um::processthreadsapi::CreateThread;
use winapi::um::synchapi::WaitForSingleObject;
use winapi::um::winbase::{INFINITE, STACK_SIZE_PARAM_IS_A_RESERVATION, WAIT_FAILED, WAIT_OBJECT_0};
use winapi::um::winnt::HANDLE;

#[repr(C, align(64))]
struct ControlBlock {
    function: ThreadProc,
    argument: *mut c_void,
    result: UnsafeCell<*mut c_void>,
    state: AtomicU32,
    arena: UnsafeCell<Arena>,
    context: *mut Context,
}

/// Owned heap block + thread handle of one runtime thread
pub(super) struct NativeThread {
    base: NonNull<u8>,
    block: NonNull<ControlBlock>,
    storage: NonNull<u8>,
    stack_size: usize,
    storage_size: usize,
    handle: HANDLE,
}

impl NativeThread {
    pub fn allocate(stack_size: usize, storage_size: usize) -> core::result::Result<Self, OsError> {
        let header = size_of::<ControlBlock>() + align_of::<ControlBlock>();
        let len = header
            .checked_add(storage_size)
            .ok_or(OsError::from_raw(ERROR_NOT_ENOUGH_MEMORY as i32))?;

        let raw = unsafe { HeapAlloc(GetProcessHeap(), 0, len) } as *mut u8;
        let base = NonNull::new(raw).ok_or(OsError::from_raw(ERROR_NOT_ENOUGH_MEMORY as i32))?;

        let block = unsafe { place::<ControlBlock>(base.as_ptr(), len, Placement::Start) };
        // Safety: storage follows the block inside the same allocation
        let storage = unsafe {
            NonNull::new_unchecked((block.as_ptr() as *mut u8).add(size_of::<ControlBlock>()))
        };

        Ok(Self {
            base,
            block,
            storage,
            stack_size,
            storage_size,
            handle: ptr::null_mut(),
        })
    }

    #[inline]
    pub fn fits(&self, stack_size: usize, storage_size: usize) -> bool {
        self.stack_size == stack_size && self.storage_size == storage_size
    }

    pub fn prepare(
        &mut self,
        function: ThreadProc,
        argument: *mut c_void,
        base: &Context,
    ) -> core::result::Result<(), OsError> {
        self.close_handle();
        let cb = self.block.as_ptr();

        unsafe {
            ptr::write(
                cb,
                ControlBlock {
                    function,
                    argument,
                    result: UnsafeCell::new(ptr::null_mut()),
                    state: AtomicU32::new(State::Ready as u32),
                    arena: UnsafeCell::new(Arena::from_raw_parts(self.storage.as_ptr(), self.storage_size)),
                    context: ptr::null_mut(),
                },
            );

            let arena = &mut *(*cb).arena.get();
            let slot = arena
                .alloc(size_of::<Context>())
                .ok_or(OsError::from_raw(ERROR_NOT_ENOUGH_MEMORY as i32))?
                .cast::<Context>();
            let mut copy = *base;
            copy.allocator = arena.allocator();
            slot.as_ptr().write(copy);
            (*cb).context = slot.as_ptr();
        }
        Ok(())
    }

    pub fn launch(&mut self) -> core::result::Result<u64, OsError> {
        let mut tid: DWORD = 0;
        let handle = unsafe {
            CreateThread(
                ptr::null_mut(),
                self.stack_size,
                Some(thread_entry),
                self.block.as_ptr() as LPVOID,
                STACK_SIZE_PARAM_IS_A_RESERVATION,
                &mut tid,
            )
        };

        if handle.is_null() {
            return Err(OsError::last());
        }
        self.handle = handle;
        Ok(u64::from(tid))
    }

    pub fn join(&self, timeout: Option<Duration>) -> Result<()> {
        match unsafe { WaitForSingleObject(self.handle, timeout_ms(timeout)) } {
            WAIT_OBJECT_0 => Ok(()),
            WAIT_TIMEOUT => Err(Error::TimedOut),
            WAIT_FAILED => Err(Error::Wait(OsError::last())),
            other => Err(Error::Wait(OsError::from_raw(other as i32))),
        }
    }

    #[inline]
    pub fn state(&self) -> State {
        State::from_raw(self.block().state.load(Ordering::SeqCst))
    }

    #[inline]
    pub fn result(&self) -> *mut c_void {
        unsafe { *self.block().result.get() }
    }

    #[inline]
    pub fn storage(&self) -> (NonNull<u8>, usize) {
        (self.storage, self.storage_size)
    }

    #[inline]
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    #[inline]
    pub fn context(&self) -> NonNull<Context> {
        // Safety: set by a successful `prepare`
        unsafe { NonNull::new_unchecked(self.block().context) }
    }

    #[inline]
    fn block(&self) -> &ControlBlock {
        unsafe { self.block.as_ref() }
    }

    fn close_handle(&mut self) {
        if !self.handle.is_null() {
            unsafe { CloseHandle(self.handle) };
            self.handle = ptr::null_mut();
        }
    }
}

impl Drop for NativeThread {
    fn drop(&mut self) {
        self.close_handle();
        unsafe { HeapFree(GetProcessHeap(), 0, self.base.as_ptr() as LPVOID) };
    }
}

/// Milliseconds for `WaitForSingleObject`, rounded up so a wait never ends early
fn timeout_ms(timeout: Option<Duration>) -> DWORD {
    match timeout {
        None => INFINITE,
        Some(d) => {
            let ms = d.as_nanos().div_ceil(1_000_000);
            ms.min(u128::from(INFINITE - 1)) as DWORD
        }
    }
}

unsafe extern "system" fn thread_entry(param: LPVOID) -> DWORD {
    let block = &*(param as *const ControlBlock);

    // Safety: the context copy lives in storage until the thread is joined
    context::set_current(NonNull::new_unchecked(block.context));
    block.state.store(State::Running as u32, Ordering::SeqCst);

    let result = (block.function)(block.argument);

    *block.result.get() = result;
    block.state.store(State::Stopped as u32, Ordering::SeqCst);
    0
}
