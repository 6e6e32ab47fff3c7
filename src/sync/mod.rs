//! Synchronization primitives.
//!
//! The public engines ([`Mutex`], [`Condvar`], [`RwLock`], [`Barrier`])
//! live in the submodules. This module also provides the crate-internal
//! word lock: a minimal 0/1/2 futex mutex with no owner tracking, no
//! cancellation, and no bookkeeping, used to guard the runtime's own state
//! (registry, TCB lists, key table). It is exposed through
//! `lock_api::RawMutex` so internal state can use the typed
//! `lock_api::Mutex` wrapper.

pub mod barrier;
pub mod condvar;
pub mod mutex;
pub mod rwlock;
pub mod wait;

pub use barrier::{Barrier, BarrierWaitResult};
pub use condvar::Condvar;
pub use mutex::{Mutex, MutexAttr, MutexType, Protocol};
pub use rwlock::RwLock;
pub use wait::{Deadline, WaitOutcome};

use crate::error::{Error, Result};
use crate::sys;
use core::sync::atomic::AtomicU32;
use core::sync::atomic::Ordering::SeqCst;
use lock_api::RawMutex as _;

/// Lifecycle word values carried by every public primitive, so operating on
/// a destroyed object is reported as [`Error::Destroyed`] rather than
/// misdiagnosed as an uninitialized one.
pub(crate) const LIFE_INITIALIZED: u32 = 0x6c49_7645;
pub(crate) const LIFE_DESTROYED: u32 = 0x6445_6144;

pub(crate) fn check_life(life: &AtomicU32) -> Result<()> {
    match life.load(SeqCst) {
        LIFE_INITIALIZED => Ok(()),
        LIFE_DESTROYED => Err(Error::Destroyed),
        _ => Err(Error::Invalid),
    }
}

/// Internal mutex type used for runtime bookkeeping state.
pub(crate) type RawLock<T> = lock_api::Mutex<RawWordLock, T>;

/// Guard type for [`RawLock`].
pub(crate) type RawLockGuard<'a, T> = lock_api::MutexGuard<'a, RawWordLock, T>;

/// Const-construct a [`RawLock`], for statics and TCB fields.
pub(crate) const fn raw_lock<T>(value: T) -> RawLock<T> {
    lock_api::Mutex::const_new(RawWordLock::INIT, value)
}

// 0 => unlocked
// 1 => locked
// 2 => locked with waiters waiting
pub(crate) struct RawWordLock(AtomicU32);

unsafe impl lock_api::RawMutex for RawWordLock {
    const INIT: Self = Self(AtomicU32::new(0));

    type GuardMarker = lock_api::GuardSend;

    #[inline]
    fn lock(&self) {
        if let Err(c) = self.0.compare_exchange(0, 1, SeqCst, SeqCst) {
            self.block(c)
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        self.0.compare_exchange(0, 1, SeqCst, SeqCst).is_ok()
    }

    #[inline]
    unsafe fn unlock(&self) {
        if self.0.swap(0, SeqCst) != 1 {
            sys::futex_wake_raw(&self.0, 1);
        }
    }

    fn is_locked(&self) -> bool {
        self.0.load(SeqCst) != 0
    }
}

impl RawWordLock {
    fn block(&self, mut c: u32) {
        loop {
            // If needed, (re-)register our intent to wait.
            if c == 2
                || (match self.0.compare_exchange(1, 2, SeqCst, SeqCst) {
                    Ok(x) | Err(x) => x,
                }) != 0
            {
                // Wait until woken. EINTR and EAGAIN both just mean
                // "re-examine the word"; this lock is never a cancellation
                // point.
                sys::futex_wait_raw(&self.0, 2, None);
            }

            // We were woken up; try to acquire the lock now.
            c = match self.0.compare_exchange(0, 2, SeqCst, SeqCst) {
                Ok(_) => break,
                Err(c) => c,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RawLock;
    use std::sync::Arc;

    #[test]
    fn word_lock_excludes() {
        let shared = Arc::new(RawLock::new(0_u64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let shared = Arc::clone(&shared);
            handles.push(std::thread::spawn(move || {
                for _ in 0..10_000 {
                    *shared.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*shared.lock(), 40_000);
    }
}
