//! Cancellation, critical sections, and the suspend handshake.
//!
//! Cancellation is delivered cooperatively. A request marks the target's
//! pending bit and nudges it with the reserved interrupt signal plus a
//! targeted wake on whatever word the target recorded it was parked on.
//! The target thread itself notices the bit at a cancellation point and
//! unwinds with a private payload; nothing is ever torn down from outside
//! the target's own stack.
//!
//! Critical sections suppress delivery entirely. The depth counter lives in
//! host TLS rather than the TCB so that entering one never touches runtime
//! state that itself takes locks.

use crate::error::{Error, Result};
use crate::sync::wait::{self, WaitOutcome};
use crate::sys;
use crate::thread::registry::registry;
use crate::thread::tcb::{
    Tcb, TcbFlags, Thread, WaitData, CANCEL_ASYNC, CANCEL_AT_POINT, CANCEL_ENABLE, CANCEL_PENDING,
};
use core::cell::Cell;
use core::sync::atomic::Ordering::SeqCst;

/// Unwind payload for a consumed cancellation request.
pub(crate) struct Cancelled;

/// Unwind payload for an explicit thread exit carrying its status.
pub(crate) struct ExitRequest(pub(crate) usize);

thread_local! {
    static CRITICAL_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// RAII critical section: while at least one is live on a thread,
/// cancellation and suspension are deferred.
pub(crate) struct Section;

impl Section {
    pub(crate) fn enter() -> Section {
        CRITICAL_DEPTH.with(|d| d.set(d.get() + 1));
        Section
    }
}

impl Drop for Section {
    fn drop(&mut self) {
        CRITICAL_DEPTH.with(|d| d.set(d.get() - 1));
    }
}

pub(crate) fn in_critical() -> bool {
    CRITICAL_DEPTH.with(|d| d.get()) > 0
}

/// Non-RAII critical section entry, for sections spanning paired calls.
pub(crate) fn critical_enter() {
    CRITICAL_DEPTH.with(|d| d.set(d.get() + 1));
}

/// Non-RAII critical section exit; must pair with [`critical_enter`].
pub(crate) fn critical_leave() {
    CRITICAL_DEPTH.with(|d| {
        if d.get() == 0 {
            crate::error::fatal("unbalanced critical section exit");
        }
        d.set(d.get() - 1);
    });
}

/// Unwind out of the calling thread with a cancellation payload. The
/// trampoline (or the initial-thread exit path) catches it and records
/// the canceled status.
fn deliver(tcb: &Tcb) -> ! {
    // Consume the request so repeated points don't re-deliver during
    // unwind-side cleanup.
    tcb.cancel_clear(CANCEL_PENDING);
    log::trace!(target: "weft::cancel", "delivering cancellation to thread seq={}", tcb.seq);
    std::panic::resume_unwind(Box::new(Cancelled));
}

/// Unwind out of the calling thread with an exit status.
pub(crate) fn exit_with(status: usize) -> ! {
    std::panic::resume_unwind(Box::new(ExitRequest(status)));
}

/// A cancellation point against a known TCB: park at a suspend request if
/// one is posted, then deliver a pending cancel if delivery is allowed.
pub(crate) fn checkpoint_with(tcb: &Tcb) {
    if in_critical() {
        return;
    }
    park_if_suspended(tcb);
    if tcb.cancel_deliverable() {
        deliver(tcb);
    }
}

/// The classic explicit cancellation point.
pub fn test_cancel() {
    crate::thread::with_current(checkpoint_with);
}

/// Marks the span of a kernel block inside a cancellation point. While the
/// guard is live the interrupt nudge is known to land as `EINTR`, so the
/// requester always signals the target's host thread.
pub(crate) struct PointGuard<'a> {
    tcb: &'a Tcb,
}

impl<'a> PointGuard<'a> {
    pub(crate) fn enter(tcb: &'a Tcb) -> PointGuard<'a> {
        checkpoint_with(tcb);
        tcb.cancel_set(CANCEL_AT_POINT);
        PointGuard { tcb }
    }
}

impl Drop for PointGuard<'_> {
    fn drop(&mut self) {
        self.tcb.cancel_clear(CANCEL_AT_POINT);
    }
}

/// Record what the current thread is about to park on, so a cancellation
/// or suspension request can aim its wake. Restores `WaitData::None` on
/// drop.
pub(crate) struct ParkRecord<'a> {
    tcb: &'a Tcb,
}

impl<'a> ParkRecord<'a> {
    pub(crate) fn enter(tcb: &'a Tcb, data: WaitData) -> ParkRecord<'a> {
        *tcb.wait_data.lock() = data;
        ParkRecord { tcb }
    }
}

impl Drop for ParkRecord<'_> {
    fn drop(&mut self) {
        *self.tcb.wait_data.lock() = WaitData::None;
    }
}

/// Set whether cancellation is enabled for the calling thread, returning
/// the previous setting. Re-enabling with a request already pending acts
/// as a cancellation point.
pub fn set_cancel_enabled(enabled: bool) -> bool {
    crate::thread::with_current(|tcb| {
        let prev = if enabled {
            tcb.cancel_set(CANCEL_ENABLE)
        } else {
            tcb.cancel_clear(CANCEL_ENABLE)
        };
        if enabled && prev & CANCEL_PENDING != 0 {
            checkpoint_with(tcb);
        }
        prev & CANCEL_ENABLE != 0
    })
}

/// Set asynchronous cancelability for the calling thread, returning the
/// previous setting. In asynchronous mode a pending request is acted on at
/// the first flag check after the nudge rather than only at declared
/// points.
pub fn set_cancel_async(async_mode: bool) -> bool {
    crate::thread::with_current(|tcb| {
        let prev = if async_mode {
            tcb.cancel_set(CANCEL_ASYNC)
        } else {
            tcb.cancel_clear(CANCEL_ASYNC)
        };
        if async_mode && prev & CANCEL_PENDING != 0 {
            checkpoint_with(tcb);
        }
        prev & CANCEL_ASYNC != 0
    })
}

/// Request cancellation of `thread`. Always returns promptly; the target
/// consumes the request at its next eligible point.
pub fn cancel(thread: Thread) -> Result<()> {
    registry().with(thread, |tcb| {
        let prev = tcb.cancel_set(CANCEL_PENDING);
        if prev & CANCEL_ENABLE == 0 {
            // Disabled targets just accumulate the request.
            return;
        }
        if prev & (CANCEL_AT_POINT | CANCEL_ASYNC) != 0 {
            nudge(tcb);
        }
    })
}

/// Post a suspend request; the target parks at its next safe point and
/// stays parked until [`resume`].
pub fn suspend(thread: Thread) -> Result<()> {
    registry().with(thread, |tcb| {
        if tcb.is_dead() {
            return Err(Error::Invalid);
        }
        tcb.set_flags(TcbFlags::NEEDS_SUSPEND);
        nudge(tcb);
        Ok(())
    })?
}

/// Clear a suspend request and release the target if it is parked.
pub fn resume(thread: Thread) -> Result<()> {
    registry().with(thread, |tcb| {
        tcb.clear_flags(TcbFlags::NEEDS_SUSPEND);
        tcb.suspend_cycle.fetch_add(1, SeqCst);
        wait::wake_all(&tcb.suspend_cycle);
    })
}

/// Park the calling thread while its suspend flag is posted.
pub(crate) fn park_if_suspended(tcb: &Tcb) {
    while tcb.flags().contains(TcbFlags::NEEDS_SUSPEND) {
        tcb.set_flags(TcbFlags::SUSPENDED);
        let cycle = tcb.suspend_cycle.load(SeqCst);
        // Re-check after publishing SUSPENDED so a racing resume's cycle
        // bump isn't missed.
        if tcb.flags().contains(TcbFlags::NEEDS_SUSPEND) {
            let _rec = ParkRecord::enter(tcb, WaitData::Suspend);
            match wait::wait(&tcb.suspend_cycle, cycle, None) {
                WaitOutcome::Woken
                | WaitOutcome::ValueChanged
                | WaitOutcome::Interrupted
                | WaitOutcome::TimedOut => {}
            }
        }
    }
    tcb.clear_flags(TcbFlags::SUSPENDED);
}

/// Kick a target out of whatever it is blocked in: signal its host thread
/// so a kernel wait returns `EINTR`, and wake the word it recorded in its
/// wait data so futex parks re-check their flags.
fn nudge(tcb: &Tcb) {
    let handle = tcb.host_handle.load(SeqCst);
    // A cleared tid word means the host thread is gone and its handle is
    // no longer a valid signal target.
    if handle != 0 && tcb.tid.load(SeqCst) != 0 {
        sys::interrupt(handle as libc::pthread_t);
    }
    let data = *tcb.wait_data.lock();
    match data {
        WaitData::None => {}
        WaitData::Suspend => {
            wait::wake_all(&tcb.suspend_cycle);
        }
        WaitData::Mutex(addr)
        | WaitData::Condvar(addr)
        | WaitData::RwLock(addr)
        | WaitData::Barrier(addr) => unsafe {
            // Wake everyone parked there; uninvolved waiters treat it as
            // spurious and re-park.
            sys::futex_wake_addr(addr, u32::MAX);
        },
        WaitData::Thread(target) => {
            let _ = registry().with(target, |t| {
                wait::wake_all(&t.tid);
            });
        }
    }
}
