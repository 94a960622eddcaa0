use super::*;
use crate::allocator::page_size;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

// Thread bodies below stick to atomics, the context allocator and raw
// syscalls: on Linux they run without TLS of their own.

fn small_config() -> ThreadConfig {
    ThreadConfig {
        stack_size: 64 * 1024,
        storage_size: 16 * 1024,
    }
}

#[cfg(target_os = "linux")]
unsafe fn nap(ms: u64) {
    let ts = libc::timespec {
        tv_sec: (ms / 1000) as libc::time_t,
        tv_nsec: ((ms % 1000) * 1_000_000) as _,
    };
    libc::syscall(libc::SYS_nanosleep, &ts as *const libc::timespec, ptr::null_mut::<libc::timespec>());
}

#[cfg(windows)]
unsafe fn nap(ms: u64) {
    std::thread::sleep(Duration::from_millis(ms));
}

unsafe extern "C" fn identity(arg: *mut c_void) -> *mut c_void {
    arg
}

unsafe extern "C" fn bump(arg: *mut c_void) -> *mut c_void {
    let counter = &*(arg as *const AtomicUsize);
    counter.fetch_add(1, Ordering::SeqCst);
    ptr::null_mut()
}

unsafe extern "C" fn write_sentinel(arg: *mut c_void) -> *mut c_void {
    *(arg as *mut u64) = 0xDEAD_BEEF_CAFE_F00D;
    ptr::null_mut()
}

unsafe extern "C" fn report_context(_arg: *mut c_void) -> *mut c_void {
    context::current().as_ptr() as *mut c_void
}

unsafe extern "C" fn alloc_from_context(_arg: *mut c_void) -> *mut c_void {
    match context::allocator().alloc(128) {
        Some(p) => {
            p.as_ptr().write_bytes(0xAB, 128);
            p.as_ptr() as *mut c_void
        }
        None => ptr::null_mut(),
    }
}

unsafe extern "C" fn sleep_then_return(arg: *mut c_void) -> *mut c_void {
    nap(arg as usize as u64);
    7usize as *mut c_void
}

unsafe extern "C" fn wait_for_release(arg: *mut c_void) -> *mut c_void {
    let gate = &*(arg as *const AtomicU32);
    while gate.load(Ordering::Acquire) == 0 {
        nap(1);
    }
    ptr::null_mut()
}

fn in_storage(thread: &Thread, addr: usize) -> bool {
    let (start, len) = thread.storage().expect("storage");
    let start = start.as_ptr() as usize;
    addr >= start && addr < start + len
}

// ===== Create Tests =====

#[test]
fn new_handle_owns_nothing() {
    let thread = Thread::new();
    assert_eq!(thread.state(), None);
    assert!(!thread.is_ready());
    assert!(!thread.is_running());
    assert!(!thread.is_stopped());
    assert!(thread.storage().is_none());
    assert!(thread.result().is_null());
    assert_eq!(thread.id(), 0);
    assert_eq!(thread.stack_size(), 0);
}

#[test]
fn create_yields_ready_thread() {
    let mut thread = Thread::new();
    let arg = 42usize as *mut c_void;
    thread
        .create_with(identity, arg, None, &small_config())
        .expect("create");

    assert!(thread.is_ready());
    assert!(!thread.is_running());
    assert!(!thread.is_stopped());
    assert_eq!(thread.argument(), arg);
    assert!(thread.function().is_some());
    assert!(thread.result().is_null());

    let (_, storage_len) = thread.storage().expect("storage");
    assert_eq!(storage_len, 16 * 1024);
    assert!(thread.stack_size() > 0);
    assert!(thread.stack_size() <= 64 * 1024);
}

#[test]
fn create_rounds_sizes_to_pages() {
    let mut thread = Thread::new();
    let config = ThreadConfig {
        stack_size: 64 * 1024 + 1,
        storage_size: 1,
    };
    thread.create_with(identity, ptr::null_mut(), None, &config).expect("create");

    let (_, storage_len) = thread.storage().expect("storage");
    assert_eq!(storage_len, page_size());
}

#[test]
fn thread_context_lives_in_storage() {
    let mut thread = Thread::new();
    thread
        .create_with(identity, ptr::null_mut(), None, &small_config())
        .expect("create");

    let ctx = thread.thread_context().expect("context");
    assert!(in_storage(&thread, ctx.as_ptr() as usize));

    let caller = unsafe { *context::current().as_ptr() };
    let copy = unsafe { ctx.as_ref() };
    assert!(!copy.allocator.same_as(&caller.allocator));
    assert!(thread.starting_context().expect("base").allocator.same_as(&caller.allocator));
}

// ===== Run Tests =====

#[test]
fn start_stop_round_trip() {
    let counter = AtomicUsize::new(0);
    let mut thread = Thread::new();
    thread
        .create_with(bump, &counter as *const _ as *mut c_void, None, &small_config())
        .expect("create");

    thread.start().expect("start");
    assert_ne!(thread.id(), 0);
    thread.stop(None).expect("stop");

    assert!(thread.is_stopped());
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn result_is_visible_after_stop() {
    let mut thread = Thread::new();
    let arg = 0x1234usize as *mut c_void;
    thread.create_with(identity, arg, None, &small_config()).expect("create");
    thread.start().expect("start");
    thread.stop(None).expect("stop");

    assert_eq!(thread.result(), arg);
}

#[test]
fn writes_happen_before_stop_returns() {
    let mut target = 0u64;
    let mut thread = Thread::new();
    thread
        .create_with(write_sentinel, &mut target as *mut u64 as *mut c_void, None, &small_config())
        .expect("create");
    thread.start().expect("start");
    thread.stop(None).expect("stop");

    assert_eq!(target, 0xDEAD_BEEF_CAFE_F00D);
}

#[test]
fn stop_after_stop_is_ok() {
    let mut thread = Thread::new();
    thread
        .create_with(identity, ptr::null_mut(), None, &small_config())
        .expect("create");
    thread.start().expect("start");
    thread.stop(None).expect("first stop");
    thread.stop(Some(Duration::ZERO)).expect("second stop");
}

#[test]
fn stop_succeeds_once_stopped_is_observed() {
    let mut thread = Thread::new();
    thread
        .create_with(identity, 9usize as *mut c_void, None, &small_config())
        .expect("create");
    thread.start().expect("start");

    while !thread.is_stopped() {
        std::thread::yield_now();
    }
    // STOPPED is written just before the thread leaves its stack, so the
    // join may still wait out that short exit window
    thread.stop(Some(Duration::from_secs(5))).expect("stop");
    assert_eq!(thread.result() as usize, 9);
}

#[test]
fn stop_times_out_on_running_thread() {
    let mut thread = Thread::new();
    thread
        .create_with(sleep_then_return, 500usize as *mut c_void, None, &small_config())
        .expect("create");
    thread.start().expect("start");

    let err = thread.stop(Some(Duration::ZERO)).expect_err("still running");
    assert_eq!(err, Error::TimedOut);
    assert!(err.is_timeout());
    assert!(thread.result().is_null());

    thread.stop(None).expect("stop");
    assert!(thread.is_stopped());
    assert_eq!(thread.result() as usize, 7);
}

#[test]
fn running_state_is_observable() {
    let gate = AtomicU32::new(0);
    let mut thread = Thread::new();
    thread
        .create_with(wait_for_release, &gate as *const _ as *mut c_void, None, &small_config())
        .expect("create");
    thread.start().expect("start");

    while thread.is_ready() {
        std::thread::yield_now();
    }
    assert!(thread.is_running());

    gate.store(1, Ordering::Release);
    thread.stop(None).expect("stop");
    assert!(thread.is_stopped());
}

// ===== Context Tests =====

#[test]
fn thread_sees_its_own_context() {
    let mut thread = Thread::new();
    thread
        .create_with(report_context, ptr::null_mut(), None, &small_config())
        .expect("create");
    thread.start().expect("start");
    thread.stop(None).expect("stop");

    let seen = thread.result() as usize;
    assert_eq!(seen, thread.thread_context().expect("context").as_ptr() as usize);
    assert!(in_storage(&thread, seen));
    assert_ne!(seen, context::current().as_ptr() as usize);
}

/// Shared between two threads: both check in, then wait for `go`
struct Rendezvous {
    arrived: AtomicU32,
    go: AtomicU32,
}

unsafe extern "C" fn report_context_together(arg: *mut c_void) -> *mut c_void {
    let meet = &*(arg as *const Rendezvous);
    let seen = context::current().as_ptr() as *mut c_void;
    meet.arrived.fetch_add(1, Ordering::AcqRel);
    while meet.go.load(Ordering::Acquire) == 0 {
        nap(1);
    }
    seen
}

#[test]
fn concurrent_threads_have_isolated_contexts() {
    let meet = Rendezvous {
        arrived: AtomicU32::new(0),
        go: AtomicU32::new(0),
    };
    let arg = &meet as *const Rendezvous as *mut c_void;

    let mut a = Thread::new();
    let mut b = Thread::new();
    a.create_with(report_context_together, arg, None, &small_config()).expect("create a");
    b.create_with(report_context_together, arg, None, &small_config()).expect("create b");

    a.start().expect("start a");
    b.start().expect("start b");

    // Neither body can return before both have read their context
    while meet.arrived.load(Ordering::Acquire) < 2 {
        std::thread::yield_now();
    }
    assert!(a.is_running());
    assert!(b.is_running());
    meet.go.store(1, Ordering::Release);

    a.stop(None).expect("stop a");
    b.stop(None).expect("stop b");

    assert_ne!(a.result(), b.result());
    assert_eq!(a.result() as usize, a.thread_context().expect("context a").as_ptr() as usize);
    assert_eq!(b.result() as usize, b.thread_context().expect("context b").as_ptr() as usize);
    assert!(in_storage(&a, a.result() as usize));
    assert!(in_storage(&b, b.result() as usize));
}

#[test]
fn context_allocator_uses_storage() {
    let mut thread = Thread::new();
    thread
        .create_with(alloc_from_context, ptr::null_mut(), None, &small_config())
        .expect("create");
    thread.start().expect("start");
    thread.stop(None).expect("stop");

    let p = thread.result() as usize;
    assert_ne!(p, 0);
    assert!(in_storage(&thread, p));

    let bytes = thread.storage_bytes().expect("bytes");
    let (start, _) = thread.storage().expect("storage");
    let offset = p - start.as_ptr() as usize;
    assert!(bytes[offset..offset + 128].iter().all(|&b| b == 0xAB));
}

#[test]
fn caller_context_is_untouched() {
    let before = context::current();
    let mut thread = Thread::new();
    thread
        .create_with(report_context, ptr::null_mut(), None, &small_config())
        .expect("create");
    thread.start().expect("start");
    thread.stop(None).expect("stop");

    assert_eq!(context::current(), before);
}

// ===== Reuse Tests =====

#[test]
fn recreate_after_stop_reuses_storage() {
    let mut thread = Thread::new();
    thread
        .create_with(identity, 1usize as *mut c_void, None, &small_config())
        .expect("create");
    let (first, _) = thread.storage().expect("storage");
    thread.start().expect("start");
    thread.stop(None).expect("stop");

    thread
        .create_with(identity, 2usize as *mut c_void, None, &small_config())
        .expect("recreate");
    let (second, _) = thread.storage().expect("storage");
    assert_eq!(first, second);
    assert!(thread.is_ready());
    assert!(thread.result().is_null());

    thread.start().expect("restart");
    thread.stop(None).expect("stop");
    assert_eq!(thread.result() as usize, 2);
}

#[test]
fn recreate_with_new_sizes_reallocates() {
    let mut thread = Thread::new();
    thread
        .create_with(identity, ptr::null_mut(), None, &small_config())
        .expect("create");

    let bigger = ThreadConfig {
        stack_size: 128 * 1024,
        storage_size: 32 * 1024,
    };
    thread.create_with(identity, ptr::null_mut(), None, &bigger).expect("recreate");
    let (_, len) = thread.storage().expect("storage");
    assert_eq!(len, 32 * 1024);
}

#[test]
fn destroy_then_create_cycle() {
    let counter = AtomicUsize::new(0);
    let mut thread = Thread::new();

    for _ in 0..3 {
        thread
            .create_with(bump, &counter as *const _ as *mut c_void, None, &small_config())
            .expect("create");
        thread.start().expect("start");
        thread.stop(None).expect("stop");
        thread.destroy().expect("destroy");
        assert_eq!(thread.state(), None);
    }

    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[test]
fn destroy_without_create_is_noop() {
    let mut thread = Thread::new();
    thread.destroy().expect("destroy");
    thread.destroy().expect("destroy twice");
}

#[test]
fn destroy_unstarted_thread() {
    let mut thread = Thread::new();
    thread
        .create_with(identity, ptr::null_mut(), None, &small_config())
        .expect("create");
    thread.destroy().expect("destroy");
    assert!(thread.storage().is_none());
}

// ===== Busy Tests =====

#[test]
fn destroy_while_running_is_busy() {
    let gate = AtomicU32::new(0);
    let mut thread = Thread::new();
    thread
        .create_with(wait_for_release, &gate as *const _ as *mut c_void, None, &small_config())
        .expect("create");
    thread.start().expect("start");

    assert_eq!(thread.destroy(), Err(Error::Busy));
    assert_eq!(
        thread.create_with(identity, ptr::null_mut(), None, &small_config()),
        Err(Error::Busy)
    );
    assert!(thread.storage_bytes().is_none());

    gate.store(1, Ordering::Release);
    thread.stop(None).expect("stop");
    thread.destroy().expect("destroy");
}

#[test]
fn drop_joins_live_thread() {
    let counter = AtomicUsize::new(0);
    {
        let mut thread = Thread::new();
        thread
            .create_with(bump, &counter as *const _ as *mut c_void, None, &small_config())
            .expect("create");
        thread.start().expect("start");
    }
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

// ===== Misuse Tests =====

#[test]
#[should_panic(expected = "before create")]
fn start_without_create_panics() {
    let mut thread = Thread::new();
    let _ = thread.start();
}

#[test]
#[should_panic(expected = "not READY")]
fn start_twice_panics() {
    let mut thread = Thread::new();
    thread
        .create_with(identity, ptr::null_mut(), None, &small_config())
        .expect("create");
    thread.start().expect("start");
    thread.stop(None).expect("stop");
    let _ = thread.start();
}

#[test]
#[should_panic(expected = "never started")]
fn stop_without_start_panics() {
    let mut thread = Thread::new();
    thread
        .create_with(identity, ptr::null_mut(), None, &small_config())
        .expect("create");
    let _ = thread.stop(None);
}

#[test]
fn state_from_raw() {
    assert_eq!(State::from_raw(0), State::Ready);
    assert_eq!(State::from_raw(1), State::Running);
    assert_eq!(State::from_raw(2), State::Stopped);
}
