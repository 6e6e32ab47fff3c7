//! Condition variable tests: the no-lost-signal property, broadcast,
//! and timed waits racing banked wakeups.

use core::cell::UnsafeCell;
use core::time::Duration;
use weft::thread::{create, join, ThreadAttr};
use weft::{Condvar, Deadline, Error, Mutex, MutexAttr, MutexType};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Shared<T> {
    mutex: Mutex,
    condvar: Condvar,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for Shared<T> {}

impl<T> Shared<T> {
    fn new(value: T) -> &'static Self {
        Box::leak(Box::new(Self {
            mutex: Mutex::new(),
            condvar: Condvar::new(),
            value: UnsafeCell::new(value),
        }))
    }
}

#[test]
fn handoff_loses_no_signals() {
    init_logging();
    // Strict ping-pong: each side waits for the other's signal. Any lost
    // signal deadlocks (and fails via the watchdog deadline).
    let shared = Shared::new(0u32);
    const ROUNDS: u32 = 10_000;

    let pong = create(ThreadAttr::new(), move || {
        shared.mutex.lock().unwrap();
        for _ in 0..ROUNDS {
            while unsafe { *shared.value.get() } % 2 == 0 {
                shared
                    .condvar
                    .timedwait(&shared.mutex, Deadline::after(Duration::from_secs(30)))
                    .unwrap();
            }
            unsafe { *shared.value.get() += 1 };
            shared.condvar.signal().unwrap();
        }
        shared.mutex.unlock().unwrap();
        0
    })
    .unwrap();

    shared.mutex.lock().unwrap();
    for _ in 0..ROUNDS {
        unsafe { *shared.value.get() += 1 };
        shared.condvar.signal().unwrap();
        while unsafe { *shared.value.get() } % 2 == 1 {
            shared
                .condvar
                .timedwait(&shared.mutex, Deadline::after(Duration::from_secs(30)))
                .unwrap();
        }
    }
    shared.mutex.unlock().unwrap();

    assert_eq!(join(pong).unwrap(), 0);
    assert_eq!(unsafe { *shared.value.get() }, ROUNDS * 2);
}

#[test]
fn broadcast_releases_every_waiter() {
    init_logging();
    let shared = Shared::new(false);
    const WAITERS: usize = 8;

    let mut handles = Vec::new();
    for _ in 0..WAITERS {
        handles.push(
            create(ThreadAttr::new(), move || {
                shared.mutex.lock().unwrap();
                while !unsafe { *shared.value.get() } {
                    shared.condvar.wait(&shared.mutex).unwrap();
                }
                shared.mutex.unlock().unwrap();
                1
            })
            .unwrap(),
        );
    }

    // Let the waiters park.
    std::thread::sleep(Duration::from_millis(100));
    shared.mutex.lock().unwrap();
    unsafe { *shared.value.get() = true };
    shared.condvar.broadcast().unwrap();
    shared.mutex.unlock().unwrap();

    let mut total = 0;
    for h in handles {
        total += join(h).unwrap();
    }
    assert_eq!(total, WAITERS);
}

#[test]
fn timedwait_reports_timeout_with_mutex_reacquired() {
    init_logging();
    let shared = Shared::new(());
    shared.mutex.lock().unwrap();
    let err = shared
        .condvar
        .timedwait(&shared.mutex, Deadline::after(Duration::from_millis(50)))
        .unwrap_err();
    assert_eq!(err, Error::TimedOut);
    // The mutex must be held again on return.
    assert_eq!(shared.mutex.lock().unwrap_err(), Error::Deadlock);
    shared.mutex.unlock().unwrap();
}

#[test]
fn wait_by_non_owner_is_denied() {
    let shared = Shared::new(());
    assert_eq!(shared.condvar.wait(&shared.mutex).unwrap_err(), Error::Perm);
}

#[test]
fn signal_wakes_exactly_one_of_many() {
    init_logging();
    let shared = Shared::new(0u32);
    const WAITERS: usize = 4;

    let mut handles = Vec::new();
    for _ in 0..WAITERS {
        handles.push(
            create(ThreadAttr::new(), move || {
                shared.mutex.lock().unwrap();
                while unsafe { *shared.value.get() } == 0 {
                    shared.condvar.wait(&shared.mutex).unwrap();
                }
                // Consume one token.
                unsafe { *shared.value.get() -= 1 };
                shared.mutex.unlock().unwrap();
                0
            })
            .unwrap(),
        );
    }

    std::thread::sleep(Duration::from_millis(100));
    for _ in 0..WAITERS {
        shared.mutex.lock().unwrap();
        unsafe { *shared.value.get() += 1 };
        shared.condvar.signal().unwrap();
        shared.mutex.unlock().unwrap();
    }
    for h in handles {
        join(h).unwrap();
    }
    assert_eq!(unsafe { *shared.value.get() }, 0);
}

#[test]
fn recursive_depth_survives_a_wait() {
    init_logging();
    let shared: &'static Shared<bool> = Box::leak(Box::new(Shared {
        mutex: Mutex::with_attr(MutexAttr::new().kind(MutexType::Recursive)),
        condvar: Condvar::new(),
        value: UnsafeCell::new(false),
    }));

    shared.mutex.lock().unwrap();
    shared.mutex.lock().unwrap();
    shared.mutex.lock().unwrap();

    let helper = create(ThreadAttr::new(), move || {
        // Only runnable once the wait has released every recursion level.
        shared.mutex.lock().unwrap();
        unsafe { *shared.value.get() = true };
        shared.condvar.signal().unwrap();
        shared.mutex.unlock().unwrap();
        0
    })
    .unwrap();

    while !unsafe { *shared.value.get() } {
        shared.condvar.wait(&shared.mutex).unwrap();
    }
    assert_eq!(join(helper).unwrap(), 0);

    // The wait restored all three holds: after two unlocks the mutex is
    // still exclusive, after the third it is free.
    shared.mutex.unlock().unwrap();
    shared.mutex.unlock().unwrap();
    let while_held = create(ThreadAttr::new(), move || {
        match shared.mutex.try_lock() {
            Err(Error::Busy) => 1,
            _ => 0,
        }
    })
    .unwrap();
    assert_eq!(join(while_held).unwrap(), 1);

    shared.mutex.unlock().unwrap();
    let after_release = create(ThreadAttr::new(), move || {
        shared.mutex.lock().unwrap();
        shared.mutex.unlock().unwrap();
        2
    })
    .unwrap();
    assert_eq!(join(after_release).unwrap(), 2);
}
