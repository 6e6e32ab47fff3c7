//! The mutex engine.
//!
//! The lock word uses the kernel's priority-inheritance futex encoding for
//! every protocol: `0` means unowned, otherwise the low bits hold the
//! owner's kernel tid and the high bit marks the word contested. The non-PI
//! paths maintain that encoding themselves with CAS loops; the `Inherit`
//! protocol hands the same word to the kernel's PI lock and unlock
//! operations, which require exactly this layout.

use crate::config;
use crate::error::{Error, Result};
use crate::sync::wait::{self, Deadline, WaitOutcome};
use crate::sync::{check_life, LIFE_DESTROYED, LIFE_INITIALIZED};
use crate::sys::{self, WORD_CONTESTED, WORD_TID_MASK};
use crate::thread::cancel::{self, PointGuard};
use crate::thread::tcb::{OwnedEntry, Tcb, WaitData};
use core::sync::atomic::AtomicU32;
use core::sync::atomic::Ordering::SeqCst;

/// Relock and unlock-by-non-owner policy.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MutexType {
    /// No owner checking beyond self-relock detection; the default.
    Normal,
    /// Self-relock and non-owner unlock are reported as errors.
    ErrorCheck,
    /// Self-relock increments a depth counter; the lock is released when
    /// the depth returns to zero.
    Recursive,
    /// Like `Normal`, but spins longer before parking under contention.
    Adaptive,
}

/// Priority protocol.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Protocol {
    /// No priority interaction; the spin-then-park path.
    None,
    /// Kernel priority inheritance; acquisition and contended release go
    /// through the kernel's PI futex operations.
    Inherit,
    /// Priority ceiling; the ceiling value is tracked on the owner.
    Protect,
}

/// Creation-time mutex attributes.
#[derive(Copy, Clone, Debug)]
pub struct MutexAttr {
    kind: MutexType,
    protocol: Protocol,
    ceiling: u32,
}

impl Default for MutexAttr {
    fn default() -> Self {
        Self {
            kind: MutexType::Normal,
            protocol: Protocol::None,
            ceiling: 0,
        }
    }
}

impl MutexAttr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: MutexType) -> Self {
        self.kind = kind;
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Priority ceiling; meaningful only with [`Protocol::Protect`].
    pub fn ceiling(mut self, ceiling: u32) -> Self {
        self.ceiling = ceiling;
        self
    }
}

/// Hard cap on recursive lock depth.
const MAX_RECURSION: u32 = u32::MAX - 1;

/// Adaptive mutexes spin this multiple of the configured count.
const ADAPTIVE_SPIN_FACTOR: u32 = 4;

pub struct Mutex {
    word: AtomicU32,
    life: AtomicU32,
    kind: MutexType,
    protocol: Protocol,
    ceiling: AtomicU32,
    /// Extra depth beyond the first acquisition; written only by the owner.
    recursion: AtomicU32,
    spin_loops: AtomicU32,
    yield_loops: AtomicU32,
}

// The engine synchronizes every access through the lock word.
unsafe impl Send for Mutex {}
unsafe impl Sync for Mutex {}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    pub fn new() -> Self {
        Self::with_attr(MutexAttr::default())
    }

    pub fn with_attr(attr: MutexAttr) -> Self {
        let tun = config::tunables();
        let spin = match (attr.protocol, attr.kind) {
            // Priority protocols park immediately so the kernel can see
            // the contention. FIFO queueing does the same so arrival
            // order roughly matches wake order.
            _ if tun.queue_fifo => 0,
            (Protocol::Inherit, _) | (Protocol::Protect, _) => 0,
            (Protocol::None, MutexType::Adaptive) => {
                tun.mutex_spin_loops.saturating_mul(ADAPTIVE_SPIN_FACTOR)
            }
            (Protocol::None, _) => tun.mutex_spin_loops,
        };
        Self {
            word: AtomicU32::new(0),
            life: AtomicU32::new(LIFE_INITIALIZED),
            kind: attr.kind,
            protocol: attr.protocol,
            ceiling: AtomicU32::new(attr.ceiling),
            recursion: AtomicU32::new(0),
            spin_loops: AtomicU32::new(spin),
            yield_loops: AtomicU32::new(tun.mutex_yield_loops),
        }
    }

    /// Acquire, blocking indefinitely. A cancellation point while blocked.
    pub fn lock(&self) -> Result<()> {
        crate::thread::with_current(|tcb| self.acquire(tcb, None, true))
    }

    /// Acquire with an absolute deadline. A cancellation point while
    /// blocked.
    pub fn timedlock(&self, deadline: Deadline) -> Result<()> {
        crate::thread::with_current(|tcb| self.acquire(tcb, Some(deadline), true))
    }

    /// Acquire without ever blocking.
    pub fn try_lock(&self) -> Result<()> {
        check_life(&self.life)?;
        crate::thread::with_current(|tcb| {
            let tid = crate::thread::tid_of(tcb);
            match self.word.compare_exchange(0, tid, SeqCst, SeqCst) {
                Ok(_) => {
                    self.on_acquired(tcb);
                    Ok(())
                }
                Err(held) => {
                    if held & WORD_TID_MASK == tid {
                        return self.relock();
                    }
                    Err(Error::Busy)
                }
            }
        })
    }

    /// Acquire without being a cancellation point, for callers that must
    /// not be unwound while blocked here.
    pub fn lock_nocancel(&self) -> Result<()> {
        crate::thread::with_current(|tcb| self.acquire(tcb, None, false))
    }

    fn acquire(&self, tcb: &Tcb, deadline: Option<Deadline>, cancellable: bool) -> Result<()> {
        check_life(&self.life)?;
        let tid = crate::thread::tid_of(tcb);

        // Uncontended fast path.
        if self.word.compare_exchange(0, tid, SeqCst, SeqCst).is_ok() {
            self.on_acquired(tcb);
            return Ok(());
        }
        if self.word.load(SeqCst) & WORD_TID_MASK == tid {
            return self.relock();
        }
        if let Some(d) = deadline {
            if d.remaining().is_none() {
                return Err(Error::TimedOut);
            }
        }

        match self.protocol {
            Protocol::Inherit => self.acquire_pi(tcb, deadline, cancellable)?,
            Protocol::None | Protocol::Protect => {
                self.acquire_contended(tcb, tid, deadline, cancellable)?
            }
        }
        self.on_acquired(tcb);
        Ok(())
    }

    /// The spin-then-park slow path for non-PI protocols.
    fn acquire_contended(
        &self,
        tcb: &Tcb,
        tid: u32,
        deadline: Option<Deadline>,
        cancellable: bool,
    ) -> Result<()> {
        let mut spins = self.spin_loops.load(SeqCst);
        let mut yields = self.yield_loops.load(SeqCst);
        loop {
            let c = self.word.load(SeqCst);
            if c == 0 {
                if self.word.compare_exchange(0, tid, SeqCst, SeqCst).is_ok() {
                    return Ok(());
                }
                continue;
            }

            // Burn the spin budget only while the word is uncontested;
            // once someone has parked, join them.
            if c & WORD_CONTESTED == 0 && spins > 0 {
                spins -= 1;
                core::hint::spin_loop();
                continue;
            }
            if c & WORD_CONTESTED == 0 && yields > 0 {
                yields -= 1;
                sys::yield_now();
                continue;
            }

            // Publish contention, then park while the word is unchanged.
            let contested = c | WORD_CONTESTED;
            if c & WORD_CONTESTED == 0
                && self
                    .word
                    .compare_exchange(c, contested, SeqCst, SeqCst)
                    .is_err()
            {
                continue;
            }

            let outcome = {
                let point;
                if cancellable {
                    point = Some(PointGuard::enter(tcb));
                } else {
                    point = None;
                }
                let _rec =
                    cancel::ParkRecord::enter(tcb, WaitData::Mutex(self.word.as_ptr() as usize));
                let out = wait::wait(&self.word, contested, deadline);
                drop(point);
                out
            };
            match outcome {
                WaitOutcome::TimedOut => return Err(Error::TimedOut),
                WaitOutcome::Interrupted => {
                    if cancellable {
                        cancel::checkpoint_with(tcb);
                    }
                }
                WaitOutcome::Woken | WaitOutcome::ValueChanged => {}
            }
            check_life(&self.life)?;

            // Re-acquire with the contested bit set: we cannot know
            // whether other waiters remain parked.
            if self
                .word
                .compare_exchange(0, tid | WORD_CONTESTED, SeqCst, SeqCst)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Kernel PI acquisition. The kernel writes the owner tid and contested
    /// bit into the word itself.
    fn acquire_pi(&self, tcb: &Tcb, deadline: Option<Deadline>, cancellable: bool) -> Result<()> {
        loop {
            let abs = deadline.map(|d| d.as_absolute_realtime());
            let err = {
                let point;
                if cancellable {
                    point = Some(PointGuard::enter(tcb));
                } else {
                    point = None;
                }
                let _rec =
                    cancel::ParkRecord::enter(tcb, WaitData::Mutex(self.word.as_ptr() as usize));
                let err = sys::futex_lock_pi(&self.word, abs);
                drop(point);
                err
            };
            match err {
                0 => return Ok(()),
                libc::EINTR => {
                    if cancellable {
                        cancel::checkpoint_with(tcb);
                    }
                }
                libc::ETIMEDOUT => return Err(Error::TimedOut),
                libc::EDEADLK => return Err(Error::Deadlock),
                _ => return Err(Error::Invalid),
            }
            check_life(&self.life)?;
        }
    }

    /// Dispatch a self-relock per the mutex type.
    fn relock(&self) -> Result<()> {
        match self.kind {
            MutexType::Recursive => {
                let depth = self.recursion.load(SeqCst);
                if depth >= MAX_RECURSION {
                    return Err(Error::Again);
                }
                self.recursion.store(depth + 1, SeqCst);
                Ok(())
            }
            // Deterministic failure beats a silent self-deadlock.
            MutexType::Normal | MutexType::ErrorCheck | MutexType::Adaptive => {
                Err(Error::Deadlock)
            }
        }
    }

    /// Bookkeeping after a first (non-recursive) acquisition: push the lock
    /// onto the owner's held list and, for `Protect`, raise the tracked
    /// ceiling.
    fn on_acquired(&self, tcb: &Tcb) {
        let addr = self.word.as_ptr() as usize;
        let mut owned = tcb.owned.lock();
        match self.protocol {
            Protocol::None => owned.plain.push(OwnedEntry {
                addr,
                prev_ceiling: 0,
            }),
            Protocol::Inherit | Protocol::Protect => {
                let prev_ceiling = if self.protocol == Protocol::Protect {
                    let prev = tcb.ceiling.load(SeqCst);
                    let ceiling = self.ceiling.load(SeqCst);
                    if ceiling > prev {
                        tcb.ceiling.store(ceiling, SeqCst);
                    }
                    prev
                } else {
                    0
                };
                owned.prio.push(OwnedEntry { addr, prev_ceiling });
            }
        }
    }

    /// Release. Only the owner may unlock; a recursive mutex is released
    /// for real only when its depth returns to zero.
    pub fn unlock(&self) -> Result<()> {
        check_life(&self.life)?;
        crate::thread::with_current(|tcb| {
            let tid = crate::thread::tid_of(tcb);
            let held = self.word.load(SeqCst);
            if held & WORD_TID_MASK != tid {
                return Err(Error::Perm);
            }

            let depth = self.recursion.load(SeqCst);
            if depth > 0 {
                self.recursion.store(depth - 1, SeqCst);
                return Ok(());
            }

            self.release_word(tcb, tid);
            Ok(())
        })
    }

    fn release_word(&self, tcb: &Tcb, tid: u32) {
        let addr = self.word.as_ptr() as usize;
        {
            let mut owned = tcb.owned.lock();
            match self.protocol {
                Protocol::None => {
                    if let Some(i) = owned.plain.iter().rposition(|e| e.addr == addr) {
                        owned.plain.remove(i);
                    }
                }
                Protocol::Inherit | Protocol::Protect => {
                    if let Some(i) = owned.prio.iter().rposition(|e| e.addr == addr) {
                        let entry = owned.prio.remove(i);
                        if self.protocol == Protocol::Protect {
                            tcb.ceiling.store(entry.prev_ceiling, SeqCst);
                        }
                    }
                }
            }
        }

        match self.protocol {
            Protocol::Inherit => {
                // Uncontested PI release stays in user space.
                if self
                    .word
                    .compare_exchange(tid, 0, SeqCst, SeqCst)
                    .is_err()
                {
                    sys::futex_unlock_pi(&self.word);
                }
            }
            Protocol::None | Protocol::Protect => {
                let prev = self.word.swap(0, SeqCst);
                if prev & WORD_CONTESTED != 0 {
                    wait::wake(&self.word, 1);
                }
            }
        }
    }

    /// Fully release a held mutex on behalf of a condvar wait, returning
    /// the saved recursion depth for [`Self::reacquire`].
    pub(crate) fn release_for_wait(&self, tcb: &Tcb) -> Result<u32> {
        let tid = crate::thread::tid_of(tcb);
        if self.word.load(SeqCst) & WORD_TID_MASK != tid {
            return Err(Error::Perm);
        }
        let depth = self.recursion.swap(0, SeqCst);
        self.release_word(tcb, tid);
        Ok(depth)
    }

    /// Re-acquire after a condvar wait, restoring the saved recursion
    /// depth. Never a cancellation point.
    pub(crate) fn reacquire(&self, tcb: &Tcb, depth: u32) {
        // The word may have been destroyed out from under a cancelled
        // waiter only through a caller bug; ignore life here and take the
        // word back so the unwind can make progress.
        let tid = crate::thread::tid_of(tcb);
        if self.word.compare_exchange(0, tid, SeqCst, SeqCst).is_err() {
            match self.protocol {
                Protocol::Inherit => {
                    while sys::futex_lock_pi(&self.word, None) == libc::EINTR {}
                }
                Protocol::None | Protocol::Protect => {
                    let _ = self.acquire_contended(tcb, tid, None, false);
                }
            }
        }
        self.on_acquired(tcb);
        self.recursion.store(depth, SeqCst);
    }

    /// Mark destroyed. Fails with [`Error::Busy`] while held.
    pub fn destroy(&self) -> Result<()> {
        check_life(&self.life)?;
        if self.word.load(SeqCst) != 0 {
            return Err(Error::Busy);
        }
        self.life.store(LIFE_DESTROYED, SeqCst);
        Ok(())
    }

    /// The configured priority ceiling. `Protect` protocol only.
    pub fn ceiling(&self) -> Result<u32> {
        check_life(&self.life)?;
        if self.protocol != Protocol::Protect {
            return Err(Error::Perm);
        }
        Ok(self.ceiling.load(SeqCst))
    }

    /// Replace the priority ceiling, returning the previous value.
    /// `Protect` protocol only.
    pub fn set_ceiling(&self, ceiling: u32) -> Result<u32> {
        check_life(&self.life)?;
        if self.protocol != Protocol::Protect {
            return Err(Error::Perm);
        }
        Ok(self.ceiling.swap(ceiling, SeqCst))
    }

    /// Per-mutex spin count before parking.
    pub fn spin_loops(&self) -> u32 {
        self.spin_loops.load(SeqCst)
    }

    pub fn set_spin_loops(&self, count: u32) {
        self.spin_loops.store(count, SeqCst);
    }

    /// Per-mutex yield count between spinning and parking.
    pub fn yield_loops(&self) -> u32 {
        self.yield_loops.load(SeqCst)
    }

    pub fn set_yield_loops(&self, count: u32) {
        self.yield_loops.store(count, SeqCst);
    }

    pub fn kind(&self) -> MutexType {
        self.kind
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// The futex word address, used as the wait-data tag for targeted
    /// wakes and as the condvar's bound-mutex identity.
    pub(crate) fn word_addr(&self) -> usize {
        self.word.as_ptr() as usize
    }

    /// Whether the calling thread owns the mutex.
    pub(crate) fn owned_by(&self, tid: u32) -> bool {
        self.word.load(SeqCst) & WORD_TID_MASK == tid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_lock_reports_busy() {
        let m = Mutex::new();
        m.lock().unwrap();
        let m = &m;
        std::thread::scope(|s| {
            s.spawn(move || {
                assert_eq!(m.try_lock().unwrap_err(), Error::Busy);
            });
        });
        m.unlock().unwrap();
    }

    #[test]
    fn normal_self_relock_is_deadlock() {
        let m = Mutex::new();
        m.lock().unwrap();
        assert_eq!(m.lock().unwrap_err(), Error::Deadlock);
        m.unlock().unwrap();
    }

    #[test]
    fn recursive_depth_counts_down() {
        let m = Mutex::with_attr(MutexAttr::new().kind(MutexType::Recursive));
        m.lock().unwrap();
        m.lock().unwrap();
        m.lock().unwrap();
        m.unlock().unwrap();
        m.unlock().unwrap();
        // Still held until the outermost unlock.
        std::thread::scope(|s| {
            let m = &m;
            s.spawn(move || {
                assert_eq!(m.try_lock().unwrap_err(), Error::Busy);
            });
        });
        m.unlock().unwrap();
        m.lock().unwrap();
        m.unlock().unwrap();
    }

    #[test]
    fn unlock_by_non_owner_is_denied() {
        let m = Mutex::new();
        m.lock().unwrap();
        let m = &m;
        std::thread::scope(|s| {
            s.spawn(move || {
                assert_eq!(m.unlock().unwrap_err(), Error::Perm);
            });
        });
        m.unlock().unwrap();
    }

    #[test]
    fn destroy_while_held_is_busy() {
        let m = Mutex::new();
        m.lock().unwrap();
        assert_eq!(m.destroy().unwrap_err(), Error::Busy);
        m.unlock().unwrap();
        m.destroy().unwrap();
        assert_eq!(m.lock().unwrap_err(), Error::Destroyed);
    }

    #[test]
    fn ceiling_requires_protect_protocol() {
        let m = Mutex::new();
        assert_eq!(m.ceiling().unwrap_err(), Error::Perm);
        let p = Mutex::with_attr(MutexAttr::new().protocol(Protocol::Protect).ceiling(10));
        assert_eq!(p.ceiling().unwrap(), 10);
        assert_eq!(p.set_ceiling(20).unwrap(), 10);
        assert_eq!(p.ceiling().unwrap(), 20);
    }
}
