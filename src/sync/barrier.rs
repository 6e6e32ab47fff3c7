//! The barrier engine.
//!
//! Arrivals accumulate under the internal word lock in FIFO order; the
//! last arrival of a cohort resets the subtotal, bumps the cycle counter,
//! and wakes everyone. The cycle counter is the futex word, so a waiter
//! woken spuriously (or by a signal) re-parks until the counter has
//! actually moved. Exactly one thread per cohort, the last to arrive,
//! observes the serial indication.

use crate::error::{Error, Result};
use crate::sync::wait::{self, WaitOutcome};
use crate::sync::{check_life, raw_lock, RawLock, LIFE_DESTROYED, LIFE_INITIALIZED};
use crate::thread::cancel::{self, PointGuard};
use crate::thread::tcb::{Thread, WaitData};
use core::sync::atomic::AtomicU32;
use core::sync::atomic::Ordering::SeqCst;

struct BarrierInner {
    total: u32,
    subtotal: u32,
    /// Arrived threads in arrival order, cleared at each release.
    arrivals: Vec<Thread>,
}

pub struct Barrier {
    /// Cohort cycle counter; the word waiters park on.
    cycle: AtomicU32,
    life: AtomicU32,
    inner: RawLock<BarrierInner>,
}

/// What a completed [`Barrier::wait`] observed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BarrierWaitResult {
    serial: bool,
}

impl BarrierWaitResult {
    /// `true` for exactly one thread of each cohort, the last to arrive.
    pub fn is_serial(&self) -> bool {
        self.serial
    }
}

/// Backs the arrival out if the wait unwinds on cancellation, so the
/// cohort count stays truthful for the remaining threads.
struct ArrivalGuard<'a> {
    barrier: &'a Barrier,
    thread: Thread,
    cycle: u32,
    armed: bool,
}

impl Drop for ArrivalGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.barrier.inner.lock();
        // Only if our cohort has not been released in the meantime.
        if self.barrier.cycle.load(SeqCst) == self.cycle && inner.subtotal > 0 {
            inner.subtotal -= 1;
            inner.arrivals.retain(|t| *t != self.thread);
        }
    }
}

impl Barrier {
    /// A barrier releasing cohorts of `total` threads. Zero is rejected.
    pub fn new(total: u32) -> Result<Self> {
        if total == 0 {
            return Err(Error::Invalid);
        }
        Ok(Self {
            cycle: AtomicU32::new(0),
            life: AtomicU32::new(LIFE_INITIALIZED),
            inner: raw_lock(BarrierInner {
                total,
                subtotal: 0,
                arrivals: Vec::new(),
            }),
        })
    }

    /// Arrive and wait for the cohort to fill. A cancellation point; a
    /// cancelled waiter withdraws its arrival.
    pub fn wait(&self) -> Result<BarrierWaitResult> {
        check_life(&self.life)?;
        let me = crate::thread::current();
        crate::thread::with_current(|tcb| {
            let snapshot = {
                let mut inner = self.inner.lock();
                inner.subtotal += 1;
                inner.arrivals.push(me);
                if inner.subtotal == inner.total {
                    // Cohort complete; release everyone and reset for the
                    // next cycle.
                    inner.subtotal = 0;
                    inner.arrivals.clear();
                    drop(inner);
                    self.cycle.fetch_add(1, SeqCst);
                    wait::wake_all(&self.cycle);
                    return Ok(BarrierWaitResult { serial: true });
                }
                self.cycle.load(SeqCst)
            };

            let mut guard = ArrivalGuard {
                barrier: self,
                thread: me,
                cycle: snapshot,
                armed: true,
            };
            loop {
                let outcome = {
                    let _point = PointGuard::enter(tcb);
                    let _rec = cancel::ParkRecord::enter(
                        tcb,
                        WaitData::Barrier(self.cycle.as_ptr() as usize),
                    );
                    wait::wait(&self.cycle, snapshot, None)
                };
                if self.cycle.load(SeqCst) != snapshot {
                    guard.armed = false;
                    return Ok(BarrierWaitResult { serial: false });
                }
                if outcome == WaitOutcome::Interrupted {
                    cancel::checkpoint_with(tcb);
                }
            }
        })
    }

    /// Mark destroyed. Fails with [`Error::Busy`] while a cohort is
    /// partially assembled.
    pub fn destroy(&self) -> Result<()> {
        check_life(&self.life)?;
        let inner = self.inner.lock();
        if inner.subtotal > 0 {
            return Err(Error::Busy);
        }
        drop(inner);
        self.life.store(LIFE_DESTROYED, SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_total_is_rejected() {
        assert!(matches!(Barrier::new(0), Err(Error::Invalid)));
    }

    #[test]
    fn single_thread_cohort_is_serial() {
        let b = Barrier::new(1).unwrap();
        assert!(b.wait().unwrap().is_serial());
        assert!(b.wait().unwrap().is_serial());
    }

    #[test]
    fn destroy_with_partial_cohort_is_busy() {
        let b = std::sync::Arc::new(Barrier::new(2).unwrap());
        let b2 = std::sync::Arc::clone(&b);
        let h = std::thread::spawn(move || b2.wait().unwrap());
        // Give the other thread time to arrive and park.
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert_eq!(b.destroy().unwrap_err(), Error::Busy);
        assert!(b.wait().unwrap().is_serial());
        assert!(!h.join().unwrap().is_serial());
        b.destroy().unwrap();
    }
}
