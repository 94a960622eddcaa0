//! Thread lifecycle - create, start, observe, join and tear down OS threads
//!
//! Design: One owned `Thread` handle per OS thread, reusable across cycles:
//!
//! ```text
//!   create ──> READY ──start──> RUNNING ──(function returns)──> STOPPED
//!                ^                                                 │
//!                └──────────── create (reuse) / destroy <──── stop ┘
//! ```
//!
//! READY→RUNNING and RUNNING→STOPPED are written by the new thread itself,
//! so `is_*` queries are point-in-time observations. Only a successful
//! `stop` synchronizes: everything the thread wrote before returning is
//! visible to the caller afterwards.
//!
//! Platform backends (selected at compile time):
//! - `linux.rs` - `clone3` onto a self-managed stack, futex join
//! - `windows.rs` - `CreateThread`, wait-handle join

mod stack;

#[cfg(target_os = "linux")]
mod futex;
#[cfg(target_os = "linux")]
mod linux;
#[cfg(windows)]
mod windows;

#[cfg(target_os = "linux")]
use linux as sys;
#[cfg(windows)]
use windows as sys;

#[cfg(not(any(target_os = "linux", windows)))]
compile_error!("typthon-threads supports Linux and Windows");

#[cfg(test)]
mod tests;

#[cfg(target_os = "linux")]
pub use futex::{wait as futex_wait, wake as futex_wake};

use crate::config::ThreadConfig;
use crate::context::{self, Context};
use crate::error::{Error, Result};
use crate::logging;
use core::ffi::c_void;
use core::ptr::{self, NonNull};
use std::time::Duration;

/// Thread entry point: one opaque argument in, one opaque result out
///
/// On Linux the function runs on a bare kernel thread that shares its
/// creator's TLS: it may use atomics, the allocator from
/// [`context::current`] and raw syscalls, but not `std` thread-locals, the
/// global heap, or logging.
pub type ThreadProc = unsafe extern "C" fn(argument: *mut c_void) -> *mut c_void;

/// Lifecycle state
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Ready = 0,
    Running = 1,
    Stopped = 2,
}

impl State {
    #[inline]
    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => State::Ready,
            1 => State::Running,
            _ => State::Stopped,
        }
    }
}

/// Owned handle to one native thread and its stack + storage
pub struct Thread {
    id: u64,
    function: Option<ThreadProc>,
    argument: *mut c_void,
    context: Context,
    native: Option<sys::NativeThread>,
    launched: bool,
    joined: bool,
}

// Safety: the handle exclusively owns its stack and control block; the
// spawned thread only touches the control block and its own arena.
unsafe impl Send for Thread {}

impl Thread {
    /// Handle that owns no OS resources yet
    pub const fn new() -> Self {
        Self {
            id: 0,
            function: None,
            argument: ptr::null_mut(),
            context: Context::DEFAULT,
            native: None,
            launched: false,
            joined: false,
        }
    }

    /// Create with the caller's current context and the process-wide sizes
    pub fn create(&mut self, function: ThreadProc, argument: *mut c_void) -> Result<()> {
        self.create_with(function, argument, None, ThreadConfig::global())
    }

    /// Reserve (or reuse) stack + storage and prepare a READY thread
    ///
    /// `context` defaults to the caller's current context. Its copy, with the
    /// thread's private arena as allocator, becomes the new thread's current
    /// context. If no memory can be reserved the handle is left as it was.
    pub fn create_with(
        &mut self,
        function: ThreadProc,
        argument: *mut c_void,
        context: Option<&Context>,
        config: &ThreadConfig,
    ) -> Result<()> {
        if self.is_live() {
            return Err(Error::Busy);
        }

        let (stack_size, storage_size) = config.rounded();
        let base = match context {
            Some(ctx) => *ctx,
            None => unsafe { *context::current().as_ptr() },
        };

        let (mut native, reused) = match self.native.take() {
            Some(native) if native.fits(stack_size, storage_size) => (native, true),
            previous => match sys::NativeThread::allocate(stack_size, storage_size) {
                // `previous` is released only once the replacement exists
                Ok(native) => (native, false),
                Err(e) => {
                    self.native = previous;
                    logging::log_thread_error("create", &e.to_string());
                    return Err(Error::OutOfMemory(e));
                }
            },
        };

        if let Err(e) = native.prepare(function, argument, &base) {
            self.reset();
            logging::log_thread_error("create", &e.to_string());
            return Err(Error::OutOfMemory(e));
        }

        self.id = 0;
        self.function = Some(function);
        self.argument = argument;
        self.context = base;
        self.native = Some(native);
        self.launched = false;
        self.joined = false;

        logging::log_thread_create(stack_size, storage_size, reused);
        Ok(())
    }

    /// Launch the OS thread
    ///
    /// # Panics
    /// If the thread was never created or has already been started.
    pub fn start(&mut self) -> Result<()> {
        let native = match self.native.as_mut() {
            Some(native) => native,
            None => panic!("Thread::start called before create"),
        };
        assert!(
            !self.launched && native.state() == State::Ready,
            "Thread::start called on a thread that is not READY"
        );

        match native.launch() {
            Ok(id) => {
                self.id = id;
                self.launched = true;
                logging::log_thread_start(id);
                Ok(())
            }
            Err(e) => {
                logging::log_thread_error("start", &e.to_string());
                Err(Error::Spawn(e))
            }
        }
    }

    /// Join: block until the thread has stopped or `timeout` elapses
    ///
    /// `None` waits indefinitely, `Some(Duration::ZERO)` polls.
    ///
    /// Success means the OS thread has exited and its stack is free, which
    /// can trail the STOPPED state by the thread's exit syscall: a poll right
    /// after `is_stopped()` turned true may still report `TimedOut`.
    ///
    /// # Panics
    /// If the thread was never started.
    pub fn stop(&mut self, timeout: Option<Duration>) -> Result<()> {
        assert!(self.launched, "Thread::stop called on a thread that was never started");
        if self.joined {
            return Ok(());
        }

        let native = match self.native.as_ref() {
            Some(native) => native,
            None => panic!("Thread::stop called on a destroyed thread"),
        };

        match native.join(timeout) {
            Ok(()) => {
                self.joined = true;
                logging::log_thread_stop(self.id);
                Ok(())
            }
            Err(Error::TimedOut) => Err(Error::TimedOut),
            Err(e) => {
                logging::log_thread_error("stop", &e.to_string());
                Err(e)
            }
        }
    }

    /// Release stack + storage; the handle can be created again afterwards
    ///
    /// Returns [`Error::Busy`] while the thread is launched and not joined.
    pub fn destroy(&mut self) -> Result<()> {
        if self.is_live() {
            return Err(Error::Busy);
        }

        if self.native.is_some() {
            logging::log_thread_destroy(self.id);
        }
        self.reset();
        Ok(())
    }

    /// Current state, `None` before `create` / after `destroy`
    #[inline]
    pub fn state(&self) -> Option<State> {
        self.native.as_ref().map(|n| n.state())
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.state() == Some(State::Ready)
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.state() == Some(State::Running)
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.state() == Some(State::Stopped)
    }

    /// Value returned by the thread function; null until a successful `stop`
    #[inline]
    pub fn result(&self) -> *mut c_void {
        match &self.native {
            Some(native) if self.joined => native.result(),
            _ => ptr::null_mut(),
        }
    }

    /// Raw storage region backing the thread's arena
    #[inline]
    pub fn storage(&self) -> Option<(NonNull<u8>, usize)> {
        self.native.as_ref().map(|n| n.storage())
    }

    /// Storage contents, readable while the thread is not running
    pub fn storage_bytes(&self) -> Option<&[u8]> {
        if self.is_live() {
            return None;
        }
        self.storage()
            .map(|(ptr, len)| unsafe { core::slice::from_raw_parts(ptr.as_ptr(), len) })
    }

    /// Context the thread installs on itself (lives in its storage)
    #[inline]
    pub fn thread_context(&self) -> Option<NonNull<Context>> {
        self.native.as_ref().map(|n| n.context())
    }

    /// Context the thread was created from
    #[inline]
    pub fn starting_context(&self) -> Option<&Context> {
        self.native.as_ref().map(|_| &self.context)
    }

    /// Usable stack bytes
    #[inline]
    pub fn stack_size(&self) -> usize {
        self.native.as_ref().map_or(0, |n| n.stack_size())
    }

    /// OS thread id, 0 before the first successful `start`
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn function(&self) -> Option<ThreadProc> {
        self.function
    }

    #[inline]
    pub fn argument(&self) -> *mut c_void {
        self.argument
    }

    /// Launched and not yet joined
    #[inline]
    fn is_live(&self) -> bool {
        self.launched && !self.joined
    }

    fn reset(&mut self) {
        self.native = None;
        self.id = 0;
        self.function = None;
        self.argument = ptr::null_mut();
        self.context = Context::DEFAULT;
        self.launched = false;
        self.joined = false;
    }
}

impl Default for Thread {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        if !self.is_live() {
            return;
        }

        // Never release a stack that is still in use
        let joined = self.native.as_ref().map_or(Ok(()), |n| n.join(None));
        if let Err(e) = joined {
            logging::log_thread_error("drop", &e.to_string());
            core::mem::forget(self.native.take());
        }
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("launched", &self.launched)
            .field("joined", &self.joined)
            .finish()
    }
}

/// Context slot of the runtime thread executing this call, if any
#[cfg(target_os = "linux")]
#[inline]
pub(crate) fn runtime_context_slot() -> Option<&'static core::sync::atomic::AtomicPtr<Context>> {
    let marker = 0u8;
    let addr = core::hint::black_box(&marker) as *const u8 as usize;
    linux::context_slot(addr)
}
