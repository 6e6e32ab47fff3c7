//! The condition variable engine.
//!
//! The futex word is a sequence number bumped by every signal and
//! broadcast. Waiter and banked-wakeup counters live under the internal
//! word lock; a signal banks exactly one wakeup credit and wakes one
//! parked thread, and each waiter consumes exactly one credit before
//! returning. The no-lost-signal property holds because a waiter
//! registers itself in the counters before releasing the bound mutex.

use crate::error::{Error, Result};
use crate::sync::mutex::Mutex;
use crate::sync::wait::{self, Deadline, WaitOutcome};
use crate::sync::{check_life, raw_lock, RawLock, LIFE_DESTROYED, LIFE_INITIALIZED};
use crate::thread::cancel::{self, PointGuard};
use crate::thread::tcb::{Tcb, WaitData};
use core::sync::atomic::AtomicU32;
use core::sync::atomic::Ordering::SeqCst;

struct CondInner {
    waiters: u32,
    /// Signals banked and not yet consumed by a waiter.
    wakeups: u32,
    /// Word address of the mutex the current waiters are bound to. All
    /// concurrent waiters must use the same mutex.
    bound_mutex: usize,
}

pub struct Condvar {
    /// Sequence number; the word waiters park on.
    seq: AtomicU32,
    life: AtomicU32,
    inner: RawLock<CondInner>,
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

/// Restores the bound mutex on every exit path of a wait, including a
/// cancellation unwind.
struct Reacquire<'a> {
    mutex: &'a Mutex,
    tcb: &'a Tcb,
    depth: u32,
}

impl Drop for Reacquire<'_> {
    fn drop(&mut self) {
        self.mutex.reacquire(self.tcb, self.depth);
    }
}

/// Backs out this waiter's registration if the wait unwinds. If a banked
/// credit remains it re-kicks the word so a surviving waiter can claim it
/// instead of stranding it.
struct WaiterGuard<'a> {
    cv: &'a Condvar,
    armed: bool,
}

impl WaiterGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.cv.inner.lock();
        inner.waiters -= 1;
        if inner.waiters == 0 {
            inner.bound_mutex = 0;
            // No survivor can claim a banked credit; discard it rather
            // than let a future waiter consume a pre-wait signal.
            inner.wakeups = 0;
        } else if inner.wakeups > 0 {
            if inner.wakeups > inner.waiters {
                inner.wakeups = inner.waiters;
            }
            wait::wake(&self.cv.seq, 1);
        }
    }
}

impl Condvar {
    pub fn new() -> Self {
        Self {
            seq: AtomicU32::new(0),
            life: AtomicU32::new(LIFE_INITIALIZED),
            inner: raw_lock(CondInner {
                waiters: 0,
                wakeups: 0,
                bound_mutex: 0,
            }),
        }
    }

    /// Atomically release `mutex` and wait for a signal. A cancellation
    /// point; on cancellation the mutex is re-acquired before the unwind
    /// leaves this frame.
    pub fn wait(&self, mutex: &Mutex) -> Result<()> {
        self.wait_inner(mutex, None)
    }

    /// [`Self::wait`] with an absolute deadline.
    pub fn timedwait(&self, mutex: &Mutex, deadline: Deadline) -> Result<()> {
        self.wait_inner(mutex, Some(deadline))
    }

    fn wait_inner(&self, mutex: &Mutex, deadline: Option<Deadline>) -> Result<()> {
        check_life(&self.life)?;
        crate::thread::with_current(|tcb| {
            let tid = crate::thread::tid_of(tcb);
            if !mutex.owned_by(tid) {
                return Err(Error::Perm);
            }

            // Register before releasing the mutex so a signal sent by the
            // next lock holder is never lost.
            let mut snapshot = {
                let mut inner = self.inner.lock();
                if inner.waiters > 0 && inner.bound_mutex != mutex.word_addr() {
                    return Err(Error::Invalid);
                }
                inner.bound_mutex = mutex.word_addr();
                inner.waiters += 1;
                self.seq.load(SeqCst)
            };

            let depth = match mutex.release_for_wait(tcb) {
                Ok(depth) => depth,
                Err(e) => {
                    let mut inner = self.inner.lock();
                    inner.waiters -= 1;
                    if inner.waiters == 0 {
                        inner.bound_mutex = 0;
                    }
                    return Err(e);
                }
            };

            // Drop order is the reverse of declaration: the waiter
            // accounting is fixed up first, then the mutex re-acquired.
            let _reacquire = Reacquire { mutex, tcb, depth };
            let mut waiter = WaiterGuard { cv: self, armed: true };

            loop {
                let outcome = {
                    let _point = PointGuard::enter(tcb);
                    let _rec = cancel::ParkRecord::enter(
                        tcb,
                        WaitData::Condvar(self.seq.as_ptr() as usize),
                    );
                    wait::wait(&self.seq, snapshot, deadline)
                };

                match outcome {
                    WaitOutcome::Interrupted => cancel::checkpoint_with(tcb),
                    WaitOutcome::Woken | WaitOutcome::ValueChanged | WaitOutcome::TimedOut => {}
                }

                let mut inner = self.inner.lock();
                if inner.wakeups > 0 {
                    // Consume a banked credit even if the deadline fired
                    // concurrently; the wakeup would be stranded otherwise.
                    inner.wakeups -= 1;
                    inner.waiters -= 1;
                    if inner.waiters == 0 {
                        inner.bound_mutex = 0;
                    }
                    drop(inner);
                    waiter.disarm();
                    return Ok(());
                }
                if outcome == WaitOutcome::TimedOut {
                    inner.waiters -= 1;
                    if inner.waiters == 0 {
                        inner.bound_mutex = 0;
                    }
                    drop(inner);
                    waiter.disarm();
                    return Err(Error::TimedOut);
                }
                drop(inner);
                snapshot = self.seq.load(SeqCst);
            }
        })
    }

    /// Wake one waiter. Banks a single wakeup credit; a no-op with no
    /// waiters pending.
    pub fn signal(&self) -> Result<()> {
        check_life(&self.life)?;
        let mut inner = self.inner.lock();
        if inner.waiters > inner.wakeups {
            inner.wakeups += 1;
            self.seq.fetch_add(1, SeqCst);
            wait::wake(&self.seq, 1);
        }
        Ok(())
    }

    /// Wake every current waiter.
    pub fn broadcast(&self) -> Result<()> {
        check_life(&self.life)?;
        let mut inner = self.inner.lock();
        if inner.waiters > inner.wakeups {
            inner.wakeups = inner.waiters;
            self.seq.fetch_add(1, SeqCst);
            wait::wake_all(&self.seq);
        }
        Ok(())
    }

    /// Mark destroyed. Fails with [`Error::Busy`] while any thread waits.
    pub fn destroy(&self) -> Result<()> {
        check_life(&self.life)?;
        let inner = self.inner.lock();
        if inner.waiters > 0 {
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
    fn signal_without_waiters_is_a_no_op() {
        let cv = Condvar::new();
        cv.signal().unwrap();
        cv.broadcast().unwrap();
        assert_eq!(cv.seq.load(SeqCst), 0);
    }

    #[test]
    fn wait_requires_a_held_mutex() {
        let cv = Condvar::new();
        let m = Mutex::new();
        assert_eq!(cv.wait(&m).unwrap_err(), Error::Perm);
    }

    #[test]
    fn destroyed_condvar_is_reported() {
        let cv = Condvar::new();
        cv.destroy().unwrap();
        assert_eq!(cv.signal().unwrap_err(), Error::Destroyed);
    }
}
