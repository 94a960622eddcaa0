//! Error types for OS-facing thread and memory operations
//!
//! Every recoverable failure carries the raw OS code it came from so callers
//! can tell a timeout apart from a hard synchronization failure.

use core::fmt;

/// Raw OS error code (`errno` on Unix, `GetLastError()` on Windows)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OsError(i32);

impl OsError {
    #[inline]
    pub const fn from_raw(code: i32) -> Self {
        Self(code)
    }

    /// Capture the calling thread's last OS error
    ///
    /// Reads thread-local `errno`, so only call this from threads that own
    /// their TLS (never from inside a spawned Linux runtime thread).
    pub fn last() -> Self {
        Self(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }

    #[inline]
    pub const fn code(self) -> i32 {
        self.0
    }

    /// Whether this code is the platform's "wait timed out" code
    pub fn is_timeout(self) -> bool {
        #[cfg(unix)]
        {
            self.0 == libc::ETIMEDOUT
        }
        #[cfg(windows)]
        {
            self.0 == winapi::shared::winerror::WAIT_TIMEOUT as i32
                || self.0 == winapi::shared::winerror::ERROR_TIMEOUT as i32
        }
    }
}

impl fmt::Display for OsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (os error {})", std::io::Error::from_raw_os_error(self.0).kind(), self.0)
    }
}

impl std::error::Error for OsError {}

/// Thread runtime errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Stack, storage or arena reservation failed
    OutOfMemory(OsError),
    /// The OS refused to launch the thread; it is still READY
    Spawn(OsError),
    /// A join wait failed for a reason other than timeout
    Wait(OsError),
    /// The join timeout elapsed before the thread stopped
    TimedOut,
    /// The thread was launched and has not been joined yet
    Busy,
}

impl Error {
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::OutOfMemory(e) | Self::Spawn(e) | Self::Wait(e) => Some(e.code()),
            Self::TimedOut | Self::Busy => None,
        }
    }

    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory(e) => write!(f, "Failed to reserve thread memory: {}", e),
            Self::Spawn(e) => write!(f, "Failed to launch thread: {}", e),
            Self::Wait(e) => write!(f, "Failed to wait for thread: {}", e),
            Self::TimedOut => write!(f, "Timed out waiting for thread"),
            Self::Busy => write!(f, "Thread is running and has not been joined"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::OutOfMemory(e) | Self::Spawn(e) | Self::Wait(e) => Some(e),
            Self::TimedOut | Self::Busy => None,
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_distinguishable_from_wait_failure() {
        assert!(Error::TimedOut.is_timeout());
        assert_eq!(Error::TimedOut.raw_os_error(), None);

        let hard = Error::Wait(OsError::from_raw(22));
        assert!(!hard.is_timeout());
        assert_eq!(hard.raw_os_error(), Some(22));
    }

    #[cfg(unix)]
    #[test]
    fn etimedout_code_reports_timeout() {
        assert!(OsError::from_raw(libc::ETIMEDOUT).is_timeout());
        assert!(!OsError::from_raw(libc::EINVAL).is_timeout());
    }

    #[test]
    fn display_mentions_os_code() {
        let msg = Error::OutOfMemory(OsError::from_raw(12)).to_string();
        assert!(msg.contains("os error 12"), "{}", msg);
    }
}
