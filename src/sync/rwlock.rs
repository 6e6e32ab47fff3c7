//! The reader-writer lock engine.
//!
//! Writer-priority: arriving readers queue behind a blocked writer, except
//! a reader that already holds the read lock, which may re-enter (it would
//! otherwise deadlock against that writer). State and blocked counts live
//! under the internal word lock; readers and writers park on separate
//! generation-counter words. Held-lock records live in the calling
//! thread's TCB, which is what makes re-entry and the owner checks
//! possible.

use crate::error::{Error, Result};
use crate::sync::wait::{self, Deadline, WaitOutcome};
use crate::sync::{check_life, raw_lock, RawLock, LIFE_DESTROYED, LIFE_INITIALIZED};
use crate::thread::cancel::ParkRecord;
use crate::thread::tcb::{RwHold, Tcb, WaitData};
use core::sync::atomic::AtomicU32;
use core::sync::atomic::Ordering::SeqCst;

struct RwInner {
    /// Number of read holds, or `-1` while write-locked.
    state: i32,
    blocked_readers: u32,
    blocked_writers: u32,
    /// Tid of the writer while write-locked.
    writer_tid: u32,
}

pub struct RwLock {
    life: AtomicU32,
    inner: RawLock<RwInner>,
    /// Generation words readers and writers park on.
    read_gate: AtomicU32,
    write_gate: AtomicU32,
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RwLock {
    pub fn new() -> Self {
        Self {
            life: AtomicU32::new(LIFE_INITIALIZED),
            inner: raw_lock(RwInner {
                state: 0,
                blocked_readers: 0,
                blocked_writers: 0,
                writer_tid: 0,
            }),
            read_gate: AtomicU32::new(0),
            write_gate: AtomicU32::new(0),
        }
    }

    fn id(&self) -> usize {
        self as *const Self as usize
    }

    /// Find this thread's hold record for this lock.
    fn hold_index(&self, tcb: &Tcb) -> Option<usize> {
        let holds = tcb.rw_holds.lock();
        holds.iter().position(|h| h.lock == self.id())
    }

    /// Acquire the read lock, blocking while a writer holds or waits.
    pub fn rdlock(&self) -> Result<()> {
        crate::thread::with_current(|tcb| self.rdlock_inner(tcb, None))
    }

    pub fn timedrdlock(&self, deadline: Deadline) -> Result<()> {
        crate::thread::with_current(|tcb| self.rdlock_inner(tcb, Some(deadline)))
    }

    /// Acquire the read lock only if that needs no blocking.
    pub fn try_rdlock(&self) -> Result<()> {
        check_life(&self.life)?;
        crate::thread::with_current(|tcb| {
            let recursive = self.hold_index(tcb).is_some();
            if recursive && self.holds_write(tcb) {
                return Err(Error::Deadlock);
            }
            let mut inner = self.inner.lock();
            if inner.state >= 0 && (inner.blocked_writers == 0 || recursive) {
                inner.state += 1;
                drop(inner);
                self.record_read(tcb);
                Ok(())
            } else {
                Err(Error::Busy)
            }
        })
    }

    fn rdlock_inner(&self, tcb: &Tcb, deadline: Option<Deadline>) -> Result<()> {
        check_life(&self.life)?;
        if self.holds_write(tcb) {
            return Err(Error::Deadlock);
        }
        let recursive = self.hold_index(tcb).is_some();
        loop {
            let (snapshot, gate_addr) = {
                let mut inner = self.inner.lock();
                if inner.state >= 0 && (inner.blocked_writers == 0 || recursive) {
                    inner.state += 1;
                    drop(inner);
                    self.record_read(tcb);
                    return Ok(());
                }
                inner.blocked_readers += 1;
                (
                    self.read_gate.load(SeqCst),
                    self.read_gate.as_ptr() as usize,
                )
            };

            let outcome = {
                let _rec = ParkRecord::enter(tcb, WaitData::RwLock(gate_addr));
                wait::wait(&self.read_gate, snapshot, deadline)
            };

            let mut inner = self.inner.lock();
            inner.blocked_readers -= 1;
            drop(inner);
            if outcome == WaitOutcome::TimedOut {
                return Err(Error::TimedOut);
            }
            check_life(&self.life)?;
        }
    }

    /// Acquire the write lock, blocking until exclusive.
    pub fn wrlock(&self) -> Result<()> {
        crate::thread::with_current(|tcb| self.wrlock_inner(tcb, None))
    }

    pub fn timedwrlock(&self, deadline: Deadline) -> Result<()> {
        crate::thread::with_current(|tcb| self.wrlock_inner(tcb, Some(deadline)))
    }

    /// Acquire the write lock only if that needs no blocking.
    pub fn try_wrlock(&self) -> Result<()> {
        check_life(&self.life)?;
        crate::thread::with_current(|tcb| {
            if self.hold_index(tcb).is_some() {
                return Err(Error::Deadlock);
            }
            let tid = crate::thread::tid_of(tcb);
            let mut inner = self.inner.lock();
            if inner.state == 0 {
                inner.state = -1;
                inner.writer_tid = tid;
                drop(inner);
                self.record_write(tcb);
                Ok(())
            } else {
                Err(Error::Busy)
            }
        })
    }

    fn wrlock_inner(&self, tcb: &Tcb, deadline: Option<Deadline>) -> Result<()> {
        check_life(&self.life)?;
        // Holding this lock in either mode already means a self-deadlock.
        if self.hold_index(tcb).is_some() {
            return Err(Error::Deadlock);
        }
        let tid = crate::thread::tid_of(tcb);
        loop {
            let (snapshot, gate_addr) = {
                let mut inner = self.inner.lock();
                if inner.state == 0 {
                    inner.state = -1;
                    inner.writer_tid = tid;
                    drop(inner);
                    self.record_write(tcb);
                    return Ok(());
                }
                inner.blocked_writers += 1;
                (
                    self.write_gate.load(SeqCst),
                    self.write_gate.as_ptr() as usize,
                )
            };

            let outcome = {
                let _rec = ParkRecord::enter(tcb, WaitData::RwLock(gate_addr));
                wait::wait(&self.write_gate, snapshot, deadline)
            };

            let mut inner = self.inner.lock();
            inner.blocked_writers -= 1;
            // The last leaving writer may have handed the wake to us alone;
            // re-open the reader gate if no writer is waiting anymore and
            // we are about to give up.
            let none_waiting = inner.blocked_writers == 0;
            drop(inner);
            if outcome == WaitOutcome::TimedOut {
                if none_waiting {
                    self.read_gate.fetch_add(1, SeqCst);
                    wait::wake_all(&self.read_gate);
                }
                return Err(Error::TimedOut);
            }
            check_life(&self.life)?;
        }
    }

    /// Release one hold, read or write, owned by the calling thread.
    pub fn unlock(&self) -> Result<()> {
        check_life(&self.life)?;
        crate::thread::with_current(|tcb| {
            let index = self.hold_index(tcb).ok_or(Error::Perm)?;
            let is_write = {
                let holds = tcb.rw_holds.lock();
                holds[index].write > 0
            };
            if is_write {
                self.unlock_write(tcb, index)
            } else {
                self.unlock_read(tcb, index)
            }
        })
    }

    fn unlock_write(&self, tcb: &Tcb, index: usize) -> Result<()> {
        {
            let mut holds = tcb.rw_holds.lock();
            holds.remove(index);
        }
        let mut inner = self.inner.lock();
        inner.state = 0;
        inner.writer_tid = 0;
        self.wake_next(&mut inner);
        Ok(())
    }

    fn unlock_read(&self, tcb: &Tcb, index: usize) -> Result<()> {
        {
            let mut holds = tcb.rw_holds.lock();
            holds[index].read -= 1;
            if holds[index].read == 0 {
                holds.remove(index);
            }
        }
        let mut inner = self.inner.lock();
        inner.state -= 1;
        if inner.state == 0 {
            self.wake_next(&mut inner);
        }
        Ok(())
    }

    /// Writer priority: a waiting writer is released before any readers.
    fn wake_next(&self, inner: &mut RwInner) {
        if inner.blocked_writers > 0 {
            self.write_gate.fetch_add(1, SeqCst);
            wait::wake(&self.write_gate, 1);
        } else if inner.blocked_readers > 0 {
            self.read_gate.fetch_add(1, SeqCst);
            wait::wake_all(&self.read_gate);
        }
    }

    fn record_read(&self, tcb: &Tcb) {
        let mut holds = tcb.rw_holds.lock();
        match holds.iter_mut().find(|h| h.lock == self.id()) {
            Some(hold) => hold.read += 1,
            None => holds.push(RwHold {
                lock: self.id(),
                read: 1,
                write: 0,
            }),
        }
    }

    fn record_write(&self, tcb: &Tcb) {
        tcb.rw_holds.lock().push(RwHold {
            lock: self.id(),
            read: 0,
            write: 1,
        });
    }

    fn holds_write(&self, tcb: &Tcb) -> bool {
        let holds = tcb.rw_holds.lock();
        holds.iter().any(|h| h.lock == self.id() && h.write > 0)
    }

    /// Mark destroyed. Fails with [`Error::Busy`] while held or waited on.
    pub fn destroy(&self) -> Result<()> {
        check_life(&self.life)?;
        let inner = self.inner.lock();
        if inner.state != 0 || inner.blocked_readers > 0 || inner.blocked_writers > 0 {
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
    fn readers_share_writers_exclude() {
        let rw = RwLock::new();
        rw.rdlock().unwrap();
        rw.try_rdlock().unwrap();
        let r = &rw;
        std::thread::scope(|s| {
            s.spawn(move || {
                assert_eq!(r.try_wrlock().unwrap_err(), Error::Busy);
            });
        });
        rw.unlock().unwrap();
        rw.unlock().unwrap();
        rw.wrlock().unwrap();
        std::thread::scope(|s| {
            s.spawn(move || {
                assert_eq!(r.try_rdlock().unwrap_err(), Error::Busy);
            });
        });
        rw.unlock().unwrap();
    }

    #[test]
    fn write_while_reading_is_deadlock() {
        let rw = RwLock::new();
        rw.rdlock().unwrap();
        assert_eq!(rw.wrlock().unwrap_err(), Error::Deadlock);
        rw.unlock().unwrap();
    }

    #[test]
    fn unlock_without_hold_is_denied() {
        let rw = RwLock::new();
        assert_eq!(rw.unlock().unwrap_err(), Error::Perm);
    }

    #[test]
    fn destroy_while_held_is_busy() {
        let rw = RwLock::new();
        rw.rdlock().unwrap();
        assert_eq!(rw.destroy().unwrap_err(), Error::Busy);
        rw.unlock().unwrap();
        rw.destroy().unwrap();
        assert_eq!(rw.rdlock().unwrap_err(), Error::Destroyed);
    }
}
