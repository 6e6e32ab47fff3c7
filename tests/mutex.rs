//! Mutex engine tests: mutual exclusion under contention, lock types,
//! and timed acquisition.

use core::cell::UnsafeCell;
use core::time::Duration;
use weft::thread::{create, join, ThreadAttr};
use weft::{Deadline, Error, Mutex, MutexAttr, MutexType};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Counter {
    mutex: Mutex,
    value: UnsafeCell<u64>,
}

unsafe impl Sync for Counter {}

#[test]
fn contended_increments_are_exclusive() {
    init_logging();
    let counter: &'static Counter = Box::leak(Box::new(Counter {
        mutex: Mutex::new(),
        value: UnsafeCell::new(0),
    }));

    const THREADS: u64 = 4;
    const PER_THREAD: u64 = 200_000;

    let mut handles = Vec::new();
    for _ in 0..THREADS {
        handles.push(
            create(ThreadAttr::new(), move || {
                for _ in 0..PER_THREAD {
                    counter.mutex.lock().unwrap();
                    // A plain read-modify-write; only mutual exclusion
                    // keeps it correct.
                    unsafe { *counter.value.get() += 1 };
                    counter.mutex.unlock().unwrap();
                }
                0
            })
            .unwrap(),
        );
    }
    for h in handles {
        assert_eq!(join(h).unwrap(), 0);
    }

    counter.mutex.lock().unwrap();
    assert_eq!(unsafe { *counter.value.get() }, THREADS * PER_THREAD);
    counter.mutex.unlock().unwrap();
}

#[test]
fn adaptive_mutex_excludes_too() {
    init_logging();
    let counter: &'static Counter = Box::leak(Box::new(Counter {
        mutex: Mutex::with_attr(MutexAttr::new().kind(MutexType::Adaptive)),
        value: UnsafeCell::new(0),
    }));

    let mut handles = Vec::new();
    for _ in 0..4 {
        handles.push(
            create(ThreadAttr::new(), move || {
                for _ in 0..50_000 {
                    counter.mutex.lock().unwrap();
                    unsafe { *counter.value.get() += 1 };
                    counter.mutex.unlock().unwrap();
                }
                0
            })
            .unwrap(),
        );
    }
    for h in handles {
        join(h).unwrap();
    }
    assert_eq!(unsafe { *counter.value.get() }, 200_000);
}

#[test]
fn timedlock_expires_while_held() {
    init_logging();
    let mutex: &'static Mutex = Box::leak(Box::new(Mutex::new()));
    mutex.lock().unwrap();

    let t = create(ThreadAttr::new(), move || {
        let start = std::time::Instant::now();
        let err = mutex
            .timedlock(Deadline::after(Duration::from_millis(50)))
            .unwrap_err();
        assert_eq!(err, Error::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(40));
        0
    })
    .unwrap();
    assert_eq!(join(t).unwrap(), 0);
    mutex.unlock().unwrap();

    // An expired deadline still succeeds if the lock is free.
    mutex
        .timedlock(Deadline::after(Duration::ZERO))
        .unwrap();
    mutex.unlock().unwrap();
}

#[test]
fn errorcheck_rejects_foreign_unlock_and_self_relock() {
    init_logging();
    let mutex: &'static Mutex =
        Box::leak(Box::new(Mutex::with_attr(MutexAttr::new().kind(MutexType::ErrorCheck))));
    mutex.lock().unwrap();
    assert_eq!(mutex.lock().unwrap_err(), Error::Deadlock);

    let t = create(ThreadAttr::new(), move || {
        assert_eq!(mutex.unlock().unwrap_err(), Error::Perm);
        assert_eq!(mutex.try_lock().unwrap_err(), Error::Busy);
        0
    })
    .unwrap();
    join(t).unwrap();
    mutex.unlock().unwrap();
}

#[test]
fn recursive_mutex_survives_contention() {
    init_logging();
    let counter: &'static Counter = Box::leak(Box::new(Counter {
        mutex: Mutex::with_attr(MutexAttr::new().kind(MutexType::Recursive)),
        value: UnsafeCell::new(0),
    }));

    let mut handles = Vec::new();
    for _ in 0..3 {
        handles.push(
            create(ThreadAttr::new(), move || {
                for _ in 0..20_000 {
                    counter.mutex.lock().unwrap();
                    counter.mutex.lock().unwrap();
                    unsafe { *counter.value.get() += 1 };
                    counter.mutex.unlock().unwrap();
                    counter.mutex.unlock().unwrap();
                }
                0
            })
            .unwrap(),
        );
    }
    for h in handles {
        join(h).unwrap();
    }
    assert_eq!(unsafe { *counter.value.get() }, 60_000);
}

#[test]
fn spin_tuning_is_per_mutex() {
    let m = Mutex::new();
    let before = m.spin_loops();
    m.set_spin_loops(before + 100);
    assert_eq!(m.spin_loops(), before + 100);
    m.set_yield_loops(3);
    assert_eq!(m.yield_loops(), 3);

    let other = Mutex::new();
    assert_eq!(other.spin_loops(), before);
}
