//! Futex join primitive - block on a 32-bit word until woken
//!
//! Shared (non-private) operations: the kernel's `CLONE_CHILD_CLEARTID`
//! wake on thread exit is issued without `FUTEX_PRIVATE_FLAG`, and a private
//! waiter would never see it.
//!
//! Both calls go through libc's `syscall`, which writes `errno` on failure,
//! so they belong on threads with their own TLS (the joiner side).

use crate::error::OsError;
use core::ptr;
use core::sync::atomic::AtomicU32;
use std::time::Duration;

/// Block while `*word == expected`, until woken or `timeout` elapses
///
/// `Ok` means woken (possibly spuriously). `EAGAIN` means the word no
/// longer held `expected`; `ETIMEDOUT` means the timeout elapsed.
pub fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> Result<(), OsError> {
    let ts = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: d.subsec_nanos() as _,
    });
    let ts_ptr = ts.as_ref().map_or(ptr::null(), |t| t as *const libc::timespec);

    let ret = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAIT,
            expected,
            ts_ptr,
            ptr::null::<u32>(),
            0u32,
        )
    };

    if ret == 0 {
        Ok(())
    } else {
        Err(OsError::last())
    }
}

/// Wake up to `count` waiters on `word` (`None` wakes all)
///
/// Returns the number of waiters woken.
pub fn wake(word: &AtomicU32, count: Option<u32>) -> usize {
    let count = count.map_or(i32::MAX, |c| c.min(i32::MAX as u32) as i32);
    let ret = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAKE,
            count,
        )
    };
    ret.max(0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn wait_on_changed_word_returns_immediately() {
        let word = AtomicU32::new(1);
        let err = wait(&word, 0, None).expect_err("value mismatch");
        assert_eq!(err.code(), libc::EAGAIN);
    }

    #[test]
    fn wait_times_out() {
        let word = AtomicU32::new(7);
        let start = Instant::now();
        let err = wait(&word, 7, Some(Duration::from_millis(20))).expect_err("timeout");
        assert!(err.is_timeout(), "{}", err);
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn zero_timeout_polls() {
        let word = AtomicU32::new(3);
        let err = wait(&word, 3, Some(Duration::ZERO)).expect_err("poll");
        assert!(err.is_timeout());
    }

    #[test]
    fn wake_without_waiters_wakes_none() {
        let word = AtomicU32::new(0);
        assert_eq!(wake(&word, None), 0);
        assert_eq!(wake(&word, Some(1)), 0);
    }

    #[test]
    fn wake_releases_waiter() {
        let word = Arc::new(AtomicU32::new(0));
        let waiter = {
            let word = Arc::clone(&word);
            std::thread::spawn(move || {
                while word.load(Ordering::Acquire) == 0 {
                    let _ = wait(&word, 0, Some(Duration::from_secs(5)));
                }
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        word.store(1, Ordering::Release);
        wake(&word, None);
        waiter.join().expect("waiter");
    }
}
