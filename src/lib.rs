//! Typthon Threads - native 1:1 threads with per-thread storage arenas
//!
//! Each runtime thread owns one OS thread, a self-managed stack and a
//! storage region. The storage backs a bump arena that becomes the default
//! allocator of the thread's program context.
//!
//! ```ignore
//! use typthon_threads::{Thread, context};
//!
//! unsafe extern "C" fn work(arg: *mut c_void) -> *mut c_void {
//!     let scratch = context::allocator().alloc(64); // lands in storage
//!     arg
//! }
//!
//! let mut thread = Thread::new();
//! thread.create(work, ptr::null_mut())?;
//! thread.start()?;
//! thread.stop(None)?;
//! let value = thread.result();
//! ```

pub mod allocator;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod thread;

// Re-export core types
pub use allocator::{Allocator, Arena};
pub use config::ThreadConfig;
pub use context::{Context, ContextGuard};
pub use error::{Error, OsError, Result};
pub use thread::{State, Thread, ThreadProc};
