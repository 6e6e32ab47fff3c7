//! Barrier tests: exactly one serial indication per cohort, reuse across
//! cycles, and mixed-cohort arrival orders.

use core::sync::atomic::{AtomicU32, Ordering::SeqCst};
use weft::thread::{create, join, ThreadAttr};
use weft::Barrier;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn one_serial_per_cohort_across_cycles() {
    init_logging();
    const THREADS: u32 = 5;
    const CYCLES: u32 = 200;
    let barrier: &'static Barrier = Box::leak(Box::new(Barrier::new(THREADS).unwrap()));
    static SERIALS: AtomicU32 = AtomicU32::new(0);

    let mut handles = Vec::new();
    for _ in 0..THREADS {
        handles.push(
            create(ThreadAttr::new(), move || {
                let mut mine = 0;
                for _ in 0..CYCLES {
                    if barrier.wait().unwrap().is_serial() {
                        mine += 1;
                        SERIALS.fetch_add(1, SeqCst);
                    }
                }
                mine
            })
            .unwrap(),
        );
    }

    let mut total = 0;
    for h in handles {
        total += join(h).unwrap();
    }
    assert_eq!(total as u32, CYCLES);
    assert_eq!(SERIALS.load(SeqCst), CYCLES);
}

#[test]
fn barrier_synchronizes_phases() {
    init_logging();
    const THREADS: u32 = 4;
    let barrier: &'static Barrier = Box::leak(Box::new(Barrier::new(THREADS).unwrap()));
    static PHASE: AtomicU32 = AtomicU32::new(0);

    let mut handles = Vec::new();
    for _ in 0..THREADS {
        handles.push(
            create(ThreadAttr::new(), move || {
                for expected in 0..50 {
                    // Everyone must observe the phase of the cycle it is
                    // in; the serial thread advances it.
                    assert_eq!(PHASE.load(SeqCst), expected);
                    if barrier.wait().unwrap().is_serial() {
                        PHASE.fetch_add(1, SeqCst);
                    }
                    // Nobody proceeds until the phase has advanced.
                    barrier.wait().unwrap();
                }
                0
            })
            .unwrap(),
        );
    }
    for h in handles {
        assert_eq!(join(h).unwrap(), 0);
    }
    assert_eq!(PHASE.load(SeqCst), 50);
}
