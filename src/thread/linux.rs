//! Linux backend - raw `clone3` threads with an on-stack control block
//!
//! Design:
//! - The control block sits at the top of the thread's own stack; the new
//!   thread starts with its stack pointer aimed at it and calls the entry
//!   trampoline stored in its first word.
//! - The join word is the child-tid word: `CLONE_PARENT_SETTID` fills it
//!   before `launch` returns, `CLONE_CHILD_CLEARTID` zeroes it and wakes
//!   joiners once the thread has left its stack.
//! - No TLS is set up for the child (it shares the creator's TLS register),
//!   so the trampoline and everything it reaches stays off `std`
//!   thread-locals, the libc heap and the logger.

use super::futex;
use super::stack::{place, Placement, StackRegion};
use super::{State, ThreadProc};
use crate::allocator::Arena;
use crate::context::Context;
use crate::error::{Error, OsError, Result};
use core::cell::UnsafeCell;
use core::ffi::c_void;
use core::mem::size_of;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("typthon-threads supports x86_64 and aarch64 on Linux");

/// Threads share address space, fs info, files, signal handlers and the
/// thread group; the kernel reports and clears the tid in the join word.
const CLONE_FLAGS: u64 = (libc::CLONE_VM
    | libc::CLONE_FS
    | libc::CLONE_FILES
    | libc::CLONE_SIGHAND
    | libc::CLONE_THREAD
    | libc::CLONE_SYSVSEM
    | libc::CLONE_PARENT_SETTID
    | libc::CLONE_CHILD_CLEARTID) as u64;

/// Set once `clone3` answered `ENOSYS`; later launches go straight to `clone`
static CLONE3_UNAVAILABLE: AtomicBool = AtomicBool::new(false);

/// `struct clone_args`, version 0 layout
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct CloneArgs {
    flags: u64,
    pidfd: u64,
    child_tid: u64,
    parent_tid: u64,
    exit_signal: u64,
    stack: u64,
    stack_size: u64,
    tls: u64,
}

const _: () = assert!(size_of::<CloneArgs>() == 64);

/// Per-thread bookkeeping, placed at the top of the thread's stack
#[repr(C, align(64))]
struct ControlBlock {
    /// Entry trampoline; must stay the first field (the launch code calls through it)
    entry: unsafe extern "C" fn(*mut ControlBlock) -> !,
    function: ThreadProc,
    argument: *mut c_void,
    /// Written by the thread once, read by the joiner after the join word clears
    result: UnsafeCell<*mut c_void>,
    stack_size: usize,
    storage: *mut u8,
    storage_size: usize,
    /// Join word: OS tid while the thread exists, 0 before launch and after exit
    tid: AtomicU32,
    state: AtomicU32,
    arena: UnsafeCell<Arena>,
    /// Context copy living in `storage`
    context: *mut Context,
    /// Current-context slot while the thread runs
    current: AtomicPtr<Context>,
    stack_lo: usize,
    stack_hi: usize,
    /// Registry link
    next: *mut ControlBlock,
    args: CloneArgs,
}

/// Owned stack + storage + control block of one runtime thread
pub(super) struct NativeThread {
    region: StackRegion,
    block: NonNull<ControlBlock>,
    registered: bool,
}

impl NativeThread {
    /// Reserve a fresh region; sizes must already be page-rounded
    pub fn allocate(stack_size: usize, storage_size: usize) -> core::result::Result<Self, OsError> {
        let region = StackRegion::reserve(stack_size, storage_size)?;
        let (stack_lo, stack_len) = region.stack();
        let block = unsafe { place::<ControlBlock>(stack_lo, stack_len, Placement::Top) };

        Ok(Self {
            region,
            block,
            registered: false,
        })
    }

    #[inline]
    pub fn fits(&self, stack_size: usize, storage_size: usize) -> bool {
        self.region.fits(stack_size, storage_size)
    }

    /// Write a fresh READY control block, arena and context copy
    pub fn prepare(
        &mut self,
        function: ThreadProc,
        argument: *mut c_void,
        base: &Context,
    ) -> core::result::Result<(), OsError> {
        self.unregister();

        let (stack_lo, _) = self.region.stack();
        let (storage, storage_size) = self.region.storage();
        let cb = self.block.as_ptr();

        unsafe {
            ptr::write(
                cb,
                ControlBlock {
                    entry: thread_entry,
                    function,
                    argument,
                    result: UnsafeCell::new(ptr::null_mut()),
                    stack_size: cb as usize - stack_lo as usize,
                    storage: storage.as_ptr(),
                    storage_size,
                    tid: AtomicU32::new(0),
                    state: AtomicU32::new(State::Ready as u32),
                    arena: UnsafeCell::new(Arena::from_raw_parts(storage.as_ptr(), storage_size)),
                    context: ptr::null_mut(),
                    current: AtomicPtr::new(ptr::null_mut()),
                    stack_lo: stack_lo as usize,
                    stack_hi: cb as usize,
                    next: ptr::null_mut(),
                    args: CloneArgs::default(),
                },
            );

            let arena = &mut *(*cb).arena.get();
            let slot = arena
                .alloc(size_of::<Context>())
                .ok_or(OsError::from_raw(libc::ENOMEM))?
                .cast::<Context>();
            let mut copy = *base;
            copy.allocator = arena.allocator();
            slot.as_ptr().write(copy);
            (*cb).context = slot.as_ptr();
        }

        REGISTRY.register(cb);
        self.registered = true;
        Ok(())
    }

    /// Launch the OS thread at the trampoline; returns its tid
    pub fn launch(&mut self) -> core::result::Result<u64, OsError> {
        let cb = self.block.as_ptr();

        let ret = unsafe {
            let tid_word = ptr::addr_of!((*cb).tid) as u64;
            (*cb).tid.store(0, Ordering::Relaxed);
            (*cb).args = CloneArgs {
                flags: CLONE_FLAGS,
                child_tid: tid_word,
                parent_tid: tid_word,
                exit_signal: 0,
                stack: (*cb).stack_lo as u64,
                stack_size: (*cb).stack_size as u64,
                ..CloneArgs::default()
            };

            let mut ret = -(libc::ENOSYS as isize);
            if !CLONE3_UNAVAILABLE.load(Ordering::Relaxed) {
                ret = arch::clone3(ptr::addr_of_mut!((*cb).args), cb);
                if ret == -(libc::ENOSYS as isize) {
                    CLONE3_UNAVAILABLE.store(true, Ordering::Relaxed);
                    tracing::debug!(target: "thread", "clone3 unavailable, using clone");
                }
            }
            if ret == -(libc::ENOSYS as isize) {
                ret = arch::clone(CLONE_FLAGS, cb as usize, tid_word as *mut u32, cb);
            }
            ret
        };

        if ret < 0 {
            Err(OsError::from_raw(-ret as i32))
        } else {
            Ok(ret as u64)
        }
    }

    /// Block until the thread has exited or `timeout` elapses
    pub fn join(&self, timeout: Option<Duration>) -> Result<()> {
        let word = &self.block().tid;
        // A deadline past the end of time waits forever
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));

        loop {
            let tid = word.load(Ordering::Acquire);
            if tid == 0 {
                return Ok(());
            }

            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::TimedOut);
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            match futex::wait(word, tid, remaining) {
                Ok(()) => continue,
                Err(e) if e.code() == libc::EAGAIN || e.code() == libc::EINTR => continue,
                Err(e) if e.is_timeout() => {
                    if word.load(Ordering::Acquire) == 0 {
                        return Ok(());
                    }
                    return Err(Error::TimedOut);
                }
                Err(e) => return Err(Error::Wait(e)),
            }
        }
    }

    #[inline]
    pub fn state(&self) -> State {
        State::from_raw(self.block().state.load(Ordering::SeqCst))
    }

    /// Return value of the thread function; call only after a successful join
    #[inline]
    pub fn result(&self) -> *mut c_void {
        unsafe { *self.block().result.get() }
    }

    #[inline]
    pub fn storage(&self) -> (NonNull<u8>, usize) {
        let block = self.block();
        // Safety: points into the mapped region
        (unsafe { NonNull::new_unchecked(block.storage) }, block.storage_size)
    }

    /// Usable stack below the control block
    #[inline]
    pub fn stack_size(&self) -> usize {
        self.block().stack_size
    }

    /// Context copy handed to the thread
    #[inline]
    pub fn context(&self) -> NonNull<Context> {
        // Safety: set by a successful `prepare`, which `Thread` always runs first
        unsafe { NonNull::new_unchecked(self.block().context) }
    }

    #[inline]
    fn block(&self) -> &ControlBlock {
        unsafe { self.block.as_ref() }
    }

    fn unregister(&mut self) {
        if self.registered {
            REGISTRY.unregister(self.block.as_ptr());
            self.registered = false;
        }
    }
}

impl Drop for NativeThread {
    fn drop(&mut self) {
        self.unregister();
        // `region` unmaps stack and storage
    }
}

/// Entry trampoline: runs on the new thread, never returns
unsafe extern "C" fn thread_entry(cb: *mut ControlBlock) -> ! {
    let block = &*cb;

    block.current.store(block.context, Ordering::Release);
    block.state.store(State::Running as u32, Ordering::SeqCst);

    let result = (block.function)(block.argument);

    *block.result.get() = result;
    block.state.store(State::Stopped as u32, Ordering::SeqCst);

    // The kernel clears `tid` and wakes joiners once the thread is gone
    loop {
        libc::syscall(libc::SYS_exit, 0);
    }
}

/// Context slot of the runtime thread whose stack contains `addr`
#[inline]
pub(super) fn context_slot(addr: usize) -> Option<&'static AtomicPtr<Context>> {
    REGISTRY.lookup(addr)
}

// =============================================================================
// Registry of live control blocks, keyed by stack range
// =============================================================================

struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    #[inline]
    fn lock(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    #[inline]
    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

struct Registry {
    lock: SpinLock,
    head: UnsafeCell<*mut ControlBlock>,
    live: AtomicUsize,
}

unsafe impl Sync for Registry {}

static REGISTRY: Registry = Registry::new();

impl Registry {
    const fn new() -> Self {
        Self {
            lock: SpinLock::new(),
            head: UnsafeCell::new(ptr::null_mut()),
            live: AtomicUsize::new(0),
        }
    }

    fn register(&self, cb: *mut ControlBlock) {
        self.lock.lock();
        unsafe {
            (*cb).next = *self.head.get();
            *self.head.get() = cb;
        }
        self.live.fetch_add(1, Ordering::Release);
        self.lock.unlock();
    }

    fn unregister(&self, cb: *mut ControlBlock) {
        self.lock.lock();
        unsafe {
            let mut link = self.head.get();
            while !(*link).is_null() {
                if *link == cb {
                    *link = (*cb).next;
                    self.live.fetch_sub(1, Ordering::Release);
                    break;
                }
                link = ptr::addr_of_mut!((**link).next);
            }
        }
        self.lock.unlock();
    }

    fn lookup(&self, addr: usize) -> Option<&'static AtomicPtr<Context>> {
        if self.live.load(Ordering::Acquire) == 0 {
            return None;
        }

        self.lock.lock();
        let mut found = None;
        unsafe {
            let mut cb = *self.head.get();
            while !cb.is_null() {
                if addr >= (*cb).stack_lo && addr < (*cb).stack_hi {
                    // Safety: a control block outlives every frame on its own stack
                    found = Some(&*ptr::addr_of!((*cb).current));
                    break;
                }
                cb = (*cb).next;
            }
        }
        self.lock.unlock();
        found
    }
}

// =============================================================================
// Launch code
// =============================================================================

/// The child returns from the syscall on its new stack with the stack
/// pointer at the control block, then calls the trampoline stored there.
#[cfg(target_arch = "x86_64")]
mod arch {
    use super::ControlBlock;
    use core::mem::size_of;

    pub(super) unsafe fn clone3(args: *mut super::CloneArgs, cb: *mut ControlBlock) -> isize {
        let ret: isize;
        core::arch::asm!(
            "syscall",
            "test rax, rax",
            "jnz 2f",
            "xor ebp, ebp",
            "mov rdi, r12",
            "call qword ptr [r12]",
            "ud2",
            "2:",
            inlateout("rax") libc::SYS_clone3 as isize => ret,
            in("rdi") args,
            in("rsi") size_of::<super::CloneArgs>(),
            in("r12") cb,
            lateout("rcx") _,
            lateout("r11") _,
            options(nostack),
        );
        ret
    }

    pub(super) unsafe fn clone(flags: u64, sp: usize, tid: *mut u32, cb: *mut ControlBlock) -> isize {
        let ret: isize;
        core::arch::asm!(
            "syscall",
            "test rax, rax",
            "jnz 2f",
            "xor ebp, ebp",
            "mov rdi, r12",
            "call qword ptr [r12]",
            "ud2",
            "2:",
            inlateout("rax") libc::SYS_clone as isize => ret,
            in("rdi") flags,
            in("rsi") sp,
            in("rdx") tid,
            in("r10") tid,
            in("r8") 0usize,
            in("r12") cb,
            lateout("rcx") _,
            lateout("r11") _,
            options(nostack),
        );
        ret
    }
}

#[cfg(target_arch = "aarch64")]
mod arch {
    use super::ControlBlock;
    use core::mem::size_of;

    pub(super) unsafe fn clone3(args: *mut super::CloneArgs, cb: *mut ControlBlock) -> isize {
        let ret: isize;
        core::arch::asm!(
            "svc 0",
            "cbnz x0, 2f",
            "mov x29, xzr",
            "mov x30, xzr",
            "mov x0, x9",
            "ldr x10, [x9]",
            "blr x10",
            "brk #0x1",
            "2:",
            inlateout("x0") args as isize => ret,
            in("x1") size_of::<super::CloneArgs>(),
            in("x8") libc::SYS_clone3 as usize,
            in("x9") cb,
            out("x10") _,
            options(nostack),
        );
        ret
    }

    pub(super) unsafe fn clone(flags: u64, sp: usize, tid: *mut u32, cb: *mut ControlBlock) -> isize {
        let ret: isize;
        core::arch::asm!(
            "svc 0",
            "cbnz x0, 2f",
            "mov x29, xzr",
            "mov x30, xzr",
            "mov x0, x9",
            "ldr x10, [x9]",
            "blr x10",
            "brk #0x1",
            "2:",
            inlateout("x0") flags as isize => ret,
            in("x1") sp,
            in("x2") tid,
            in("x3") 0usize,
            in("x4") tid,
            in("x8") libc::SYS_clone as usize,
            in("x9") cb,
            out("x10") _,
            options(nostack),
        );
        ret
    }
}
