use criterion::{criterion_group, criterion_main, Criterion};
use std::ffi::c_void;
use std::ptr;
use typthon_threads::{Thread, ThreadConfig};

unsafe extern "C" fn noop(arg: *mut c_void) -> *mut c_void {
    arg
}

fn bench_lifecycle(c: &mut Criterion) {
    let config = ThreadConfig::default();

    c.bench_function("thread_cycle_reuse", |b| {
        let mut thread = Thread::new();
        b.iter(|| {
            thread.create_with(noop, ptr::null_mut(), None, &config).expect("create");
            thread.start().expect("start");
            thread.stop(None).expect("stop");
        });
    });

    c.bench_function("thread_cycle_fresh", |b| {
        b.iter(|| {
            let mut thread = Thread::new();
            thread.create_with(noop, ptr::null_mut(), None, &config).expect("create");
            thread.start().expect("start");
            thread.stop(None).expect("stop");
            thread.destroy().expect("destroy");
        });
    });
}

criterion_group!(benches, bench_lifecycle);
criterion_main!(benches);
