//! The wait/wake adapter.
//!
//! A thin typed wrapper over the kernel park/wake primitive: park the
//! calling thread on a 32-bit word iff the word still holds an expected
//! value, and wake up to N parked waiters on a word. The adapter performs
//! no retries and carries no semantics of its own; interrupted waits are
//! surfaced so the caller's own loop can re-check its flags and predicates.

use crate::config;
use crate::sys;
use core::sync::atomic::AtomicU32;
use core::time::Duration;

pub use crate::sys::Clock;

/// Outcome of a single [`wait`] call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A matching wake targeted this word.
    Woken,

    /// The word no longer held the expected value at the instant of the
    /// call; the caller should re-read it.
    ValueChanged,

    /// The wait was interrupted by a signal; the caller's loop decides
    /// whether to re-check cancellation/suspend flags and park again.
    Interrupted,

    /// The deadline elapsed (or had already passed when the call was made).
    TimedOut,
}

/// An absolute point in time on a specific clock.
///
/// Timed operations carry a `Deadline` and convert it to a relative
/// duration immediately before each kernel block, never once at call entry,
/// so that a wait which is woken and re-parked doesn't stretch its budget.
#[derive(Copy, Clone, Debug)]
pub struct Deadline {
    clock: Clock,
    at: Duration,
}

impl Deadline {
    /// A deadline `d` from now on the monotonic clock.
    pub fn after(d: Duration) -> Self {
        Self {
            clock: Clock::Monotonic,
            at: sys::now(Clock::Monotonic).saturating_add(d),
        }
    }

    /// A deadline `d` from now on the given clock.
    pub fn on_clock_after(clock: Clock, d: Duration) -> Self {
        Self {
            clock,
            at: sys::now(clock).saturating_add(d),
        }
    }

    /// An absolute deadline on the given clock, measured from that clock's
    /// epoch.
    pub fn at(clock: Clock, at: Duration) -> Self {
        Self { clock, at }
    }

    /// Time remaining until the deadline, or `None` if it has already
    /// passed. A deadline in the past is an immediate timeout; callers must
    /// not enter the kernel for it.
    pub(crate) fn remaining(&self) -> Option<Duration> {
        let now = sys::now(self.clock);
        if self.at <= now {
            None
        } else {
            Some(self.at - now)
        }
    }

    /// The deadline as an absolute `CLOCK_REALTIME` timestamp, which is the
    /// form the kernel's PI lock operation consumes.
    pub(crate) fn as_absolute_realtime(&self) -> Duration {
        match self.clock {
            Clock::Realtime => self.at,
            Clock::Monotonic => {
                // Re-base the remaining budget onto the realtime clock.
                let rel = self.remaining().unwrap_or(Duration::ZERO);
                sys::now(Clock::Realtime).saturating_add(rel)
            }
        }
    }
}

/// Park on `word` iff it still holds `expected`, until a wake, a signal, or
/// the deadline. One kernel attempt; no retry loop.
pub(crate) fn wait(word: &AtomicU32, expected: u32, deadline: Option<Deadline>) -> WaitOutcome {
    let timeout = match deadline {
        Some(d) => match d.remaining() {
            // Rejected synchronously; zero and negative timeouts never
            // enter the kernel.
            None => return WaitOutcome::TimedOut,
            Some(rel) => Some(rel.max(config::tunables().min_timeout)),
        },
        None => None,
    };

    match sys::futex_wait_raw(word, expected, timeout) {
        0 => WaitOutcome::Woken,
        libc::EAGAIN => WaitOutcome::ValueChanged,
        libc::EINTR => WaitOutcome::Interrupted,
        libc::ETIMEDOUT => WaitOutcome::TimedOut,
        // Anything else here means the word address went away under us.
        _ => crate::error::fatal("futex wait failed"),
    }
}

/// Wake up to `count` waiters parked on `word`; a no-op with no waiters.
pub(crate) fn wake(word: &AtomicU32, count: u32) -> u32 {
    sys::futex_wake_raw(word, count)
}

/// Wake every waiter parked on `word`.
pub(crate) fn wake_all(word: &AtomicU32) {
    sys::futex_wake_raw(word, u32::MAX);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering::SeqCst;

    #[test]
    fn expired_deadline_rejected_without_kernel_entry() {
        let d = Deadline::at(Clock::Monotonic, Duration::ZERO);
        assert!(d.remaining().is_none());
        let word = AtomicU32::new(3);
        assert_eq!(wait(&word, 3, Some(d)), WaitOutcome::TimedOut);
    }

    #[test]
    fn changed_value_is_reported() {
        let word = AtomicU32::new(5);
        word.store(6, SeqCst);
        assert_eq!(wait(&word, 5, None), WaitOutcome::ValueChanged);
    }

    #[test]
    fn deadline_remaining_shrinks() {
        let d = Deadline::after(Duration::from_millis(50));
        let a = d.remaining().unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let b = d.remaining().unwrap_or(Duration::ZERO);
        assert!(b <= a);
    }

    #[test]
    fn monotonic_deadline_rebases_to_realtime() {
        let d = Deadline::after(Duration::from_secs(1));
        let abs = d.as_absolute_realtime();
        assert!(abs > sys::now(Clock::Realtime));
    }
}
