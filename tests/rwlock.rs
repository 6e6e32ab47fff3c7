//! Reader-writer lock tests: shared readers, writer exclusion and
//! priority, recursive reads, and timed acquisition.

use core::sync::atomic::{AtomicU32, Ordering::SeqCst};
use core::time::Duration;
use weft::thread::{create, join, ThreadAttr};
use weft::{Deadline, Error, RwLock};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn many_readers_run_concurrently() {
    init_logging();
    let lock: &'static RwLock = Box::leak(Box::new(RwLock::new()));
    static INSIDE: AtomicU32 = AtomicU32::new(0);
    static PEAK: AtomicU32 = AtomicU32::new(0);
    const READERS: usize = 6;

    let mut handles = Vec::new();
    for _ in 0..READERS {
        handles.push(
            create(ThreadAttr::new(), move || {
                lock.rdlock().unwrap();
                let inside = INSIDE.fetch_add(1, SeqCst) + 1;
                PEAK.fetch_max(inside, SeqCst);
                std::thread::sleep(Duration::from_millis(100));
                INSIDE.fetch_sub(1, SeqCst);
                lock.unlock().unwrap();
                0
            })
            .unwrap(),
        );
    }
    for h in handles {
        join(h).unwrap();
    }
    assert!(PEAK.load(SeqCst) > 1, "readers never overlapped");
}

#[test]
fn writer_excludes_readers_and_writers() {
    init_logging();
    let lock: &'static RwLock = Box::leak(Box::new(RwLock::new()));
    static VALUE: AtomicU32 = AtomicU32::new(0);

    lock.wrlock().unwrap();
    let t = create(ThreadAttr::new(), move || {
        assert_eq!(lock.try_rdlock().unwrap_err(), Error::Busy);
        assert_eq!(lock.try_wrlock().unwrap_err(), Error::Busy);
        lock.wrlock().unwrap();
        assert_eq!(VALUE.load(SeqCst), 1);
        lock.unlock().unwrap();
        0
    })
    .unwrap();

    std::thread::sleep(Duration::from_millis(50));
    VALUE.store(1, SeqCst);
    lock.unlock().unwrap();
    assert_eq!(join(t).unwrap(), 0);
}

#[test]
fn waiting_writer_blocks_new_readers() {
    init_logging();
    let lock: &'static RwLock = Box::leak(Box::new(RwLock::new()));
    static WRITER_DONE: AtomicU32 = AtomicU32::new(0);

    lock.rdlock().unwrap();
    let writer = create(ThreadAttr::new(), move || {
        lock.wrlock().unwrap();
        WRITER_DONE.store(1, SeqCst);
        lock.unlock().unwrap();
        0
    })
    .unwrap();

    // Wait until the writer is parked, then verify a fresh reader queues
    // behind it rather than overtaking.
    std::thread::sleep(Duration::from_millis(100));
    let reader = create(ThreadAttr::new(), move || {
        lock.rdlock().unwrap();
        let done = WRITER_DONE.load(SeqCst);
        lock.unlock().unwrap();
        done as usize
    })
    .unwrap();
    let latecomer = create(ThreadAttr::new(), move || {
        match lock.try_rdlock() {
            Err(Error::Busy) => 1,
            Ok(()) => {
                lock.unlock().unwrap();
                0
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    })
    .unwrap();
    assert_eq!(join(latecomer).unwrap(), 1, "try_rdlock overtook a waiting writer");

    lock.unlock().unwrap();
    assert_eq!(join(writer).unwrap(), 0);
    assert_eq!(join(reader).unwrap(), 1, "reader overtook a waiting writer");
}

#[test]
fn recursive_read_bypasses_a_waiting_writer() {
    init_logging();
    let lock: &'static RwLock = Box::leak(Box::new(RwLock::new()));

    lock.rdlock().unwrap();
    let writer = create(ThreadAttr::new(), move || {
        lock.wrlock().unwrap();
        lock.unlock().unwrap();
        0
    })
    .unwrap();
    std::thread::sleep(Duration::from_millis(100));

    // Re-entry while a writer waits must not self-deadlock.
    lock.rdlock().unwrap();
    lock.unlock().unwrap();
    lock.unlock().unwrap();
    assert_eq!(join(writer).unwrap(), 0);
}

#[test]
fn timed_wrlock_expires_under_a_reader() {
    init_logging();
    let lock: &'static RwLock = Box::leak(Box::new(RwLock::new()));
    lock.rdlock().unwrap();
    let t = create(ThreadAttr::new(), move || {
        let err = lock
            .timedwrlock(Deadline::after(Duration::from_millis(50)))
            .unwrap_err();
        assert_eq!(err, Error::TimedOut);
        0
    })
    .unwrap();
    assert_eq!(join(t).unwrap(), 0);
    lock.unlock().unwrap();
    lock.wrlock().unwrap();
    lock.unlock().unwrap();
}
