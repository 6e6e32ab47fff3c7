//! Kernel adapter.
//!
//! Everything the runtime consumes from the kernel lives here: the futex
//! park/wake primitive (plain and priority-inheriting), clock reads, kernel
//! thread ids, the reserved interrupt signal used by the cancellation and
//! suspend handshakes, and the processor yield. This module carries no
//! policy; the wait loops, retries, and deadline bookkeeping all live in the
//! callers.

use core::mem;
use core::ptr;
use core::sync::atomic::AtomicU32;
use core::time::Duration;
use std::cell::Cell;
use std::sync::Once;

// Futex operation numbers. The libc crate exposes most of these, but the
// values are ABI constants and the PI pair is spotty across libc versions,
// so they're written out here.
const FUTEX_WAIT: libc::c_int = 0;
const FUTEX_WAKE: libc::c_int = 1;
const FUTEX_LOCK_PI: libc::c_int = 6;
const FUTEX_UNLOCK_PI: libc::c_int = 7;
const FUTEX_PRIVATE_FLAG: libc::c_int = 128;

/// Waiters/contested bit of a PI-style lock word. Shared with the kernel's
/// PI-futex ABI, and reused by the non-PI mutex paths so both use one word
/// encoding.
pub(crate) const WORD_CONTESTED: u32 = 0x8000_0000;

/// Mask of the owner tid within a lock word, per the PI-futex ABI.
pub(crate) const WORD_TID_MASK: u32 = 0x3fff_ffff;

/// Clocks usable for timed operations.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Clock {
    /// `CLOCK_MONOTONIC`.
    Monotonic,
    /// `CLOCK_REALTIME`.
    Realtime,
}

impl Clock {
    fn raw(self) -> libc::clockid_t {
        match self {
            Self::Monotonic => libc::CLOCK_MONOTONIC,
            Self::Realtime => libc::CLOCK_REALTIME,
        }
    }
}

/// Read a clock as a `Duration` since its epoch.
pub(crate) fn now(clock: Clock) -> Duration {
    let mut ts: libc::timespec = unsafe { mem::zeroed() };
    let r = unsafe { libc::clock_gettime(clock.raw(), &mut ts) };
    if r != 0 {
        crate::error::fatal("clock_gettime failed");
    }
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

fn to_timespec(d: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as _,
    }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL)
}

/// Raw `FUTEX_WAIT` with an optional *relative* timeout. Returns 0 when
/// woken, or the raw errno (`EAGAIN`, `EINTR`, `ETIMEDOUT`) otherwise. No
/// retries here; callers loop.
pub(crate) fn futex_wait_raw(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> i32 {
    let ts = timeout.map(to_timespec);
    let ts_ptr = ts
        .as_ref()
        .map_or(ptr::null(), |t| t as *const libc::timespec);
    let r = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            FUTEX_WAIT | FUTEX_PRIVATE_FLAG,
            expected,
            ts_ptr,
            ptr::null::<u32>(),
            0_u32,
        )
    };
    if r == 0 {
        0
    } else {
        last_errno()
    }
}

/// Wake up to `count` threads parked on `word`. A no-op when nobody is
/// parked. Returns the number actually woken.
pub(crate) fn futex_wake_raw(word: &AtomicU32, count: u32) -> u32 {
    let r = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            FUTEX_WAKE | FUTEX_PRIVATE_FLAG,
            count.min(i32::MAX as u32),
            ptr::null::<libc::timespec>(),
            ptr::null::<u32>(),
            0_u32,
        )
    };
    if r < 0 {
        0
    } else {
        r as u32
    }
}

/// Wake waiters parked on a lock word identified only by address. Used for
/// the targeted nudge when cancelling a thread whose wait-data records the
/// word it is parked on.
///
/// # Safety
///
/// `addr` must be the address of a live `AtomicU32` futex word.
pub(crate) unsafe fn futex_wake_addr(addr: usize, count: u32) {
    libc::syscall(
        libc::SYS_futex,
        addr as *mut u32,
        FUTEX_WAKE | FUTEX_PRIVATE_FLAG,
        count.min(i32::MAX as u32),
        ptr::null::<libc::timespec>(),
        ptr::null::<u32>(),
        0_u32,
    );
}

/// Kernel-arbitrated priority-inheriting lock of a PI lock word, with an
/// optional *absolute `CLOCK_REALTIME`* deadline (that is what the kernel
/// consumes for this operation). Returns 0 on acquisition or the raw errno.
pub(crate) fn futex_lock_pi(word: &AtomicU32, abs_realtime: Option<Duration>) -> i32 {
    let ts = abs_realtime.map(to_timespec);
    let ts_ptr = ts
        .as_ref()
        .map_or(ptr::null(), |t| t as *const libc::timespec);
    let r = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            FUTEX_LOCK_PI | FUTEX_PRIVATE_FLAG,
            0_u32,
            ts_ptr,
            ptr::null::<u32>(),
            0_u32,
        )
    };
    if r == 0 {
        0
    } else {
        last_errno()
    }
}

/// Release a PI lock word whose contested bit is set, letting the kernel
/// pick and wake the next owner. Returns 0 or the raw errno.
pub(crate) fn futex_unlock_pi(word: &AtomicU32) -> i32 {
    let r = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            FUTEX_UNLOCK_PI | FUTEX_PRIVATE_FLAG,
            0_u32,
            ptr::null::<libc::timespec>(),
            ptr::null::<u32>(),
            0_u32,
        )
    };
    if r == 0 {
        0
    } else {
        last_errno()
    }
}

thread_local! {
    static TID: Cell<u32> = const { Cell::new(0) };
}

/// The calling thread's kernel thread id, cached per thread.
pub(crate) fn gettid() -> u32 {
    TID.with(|tid| {
        let v = tid.get();
        if v != 0 {
            return v;
        }
        let v = unsafe { libc::syscall(libc::SYS_gettid) } as u32;
        tid.set(v);
        v
    })
}

/// Refresh the cached tid; the child of a fork keeps the parent's cache
/// otherwise.
pub(crate) fn refresh_tid() -> u32 {
    TID.with(|tid| tid.set(0));
    gettid()
}

/// The system page size, used to size default guard regions.
pub(crate) fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Yield the processor.
pub(crate) fn yield_now() {
    unsafe {
        libc::sched_yield();
    }
}

/// The reserved signal used to interrupt a thread blocked in the kernel so
/// it re-checks its cancellation and suspend flags.
pub(crate) fn interrupt_signal() -> libc::c_int {
    libc::SIGRTMIN() + 6
}

// The handler itself does nothing; its only job is to exist with
// `SA_RESTART` absent, so that an in-kernel futex wait returns `EINTR` and
// the interrupted thread's own loop runs the real logic after the handler
// returns.
extern "C" fn interrupt_handler(_sig: libc::c_int) {}

/// Install the interrupt handler, once per process.
pub(crate) fn install_interrupt_handler() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction = interrupt_handler as extern "C" fn(libc::c_int) as usize;
        sa.sa_flags = 0;
        libc::sigemptyset(&mut sa.sa_mask);
        if libc::sigaction(interrupt_signal(), &sa, ptr::null_mut()) != 0 {
            crate::error::fatal("sigaction for the interrupt signal failed");
        }
    });
}

/// The calling thread's host thread handle, used as the target for
/// [`interrupt`].
pub(crate) fn self_thread_handle() -> libc::pthread_t {
    unsafe { libc::pthread_self() }
}

/// Deliver the interrupt signal to a thread.
pub(crate) fn interrupt(handle: libc::pthread_t) {
    unsafe {
        libc::pthread_kill(handle, interrupt_signal());
    }
}
