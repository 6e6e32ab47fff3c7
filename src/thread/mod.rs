//! Thread lifecycle: create, join, detach, exit, and the current-thread
//! accessor.
//!
//! A new thread is backed by a kernel thread obtained from the host; the
//! trampoline publishes the kernel tid into the TCB's tid word when the
//! thread starts and clears it (with a wake) when the thread terminates,
//! so joiners park on the tid word itself. Foreign threads that touch the
//! runtime are registered lazily and never reclaimed.

pub mod cancel;
pub mod registry;
pub mod tcb;
pub mod tls;

pub use cancel::{
    cancel, resume, set_cancel_async, set_cancel_enabled, suspend, test_cancel,
};
pub use tcb::{Thread, ThreadAttr};

use crate::error::{fatal, Error, Result};
use crate::sync::wait::{self, Deadline, WaitOutcome};
use crate::sys;
use crate::thread::cancel::{Cancelled, ExitRequest, PointGuard};
use crate::thread::registry::registry;
use crate::thread::tcb::{JoinSlot, Tcb, TcbFlags, WaitData, STATE_DEAD};
use core::cell::Cell;
use core::sync::atomic::Ordering::SeqCst;
use std::panic::{self, AssertUnwindSafe};

/// Exit status recorded for a thread that was cancelled.
pub const CANCELED: usize = usize::MAX;

thread_local! {
    /// The calling thread's registry handle and TCB address.
    static CURRENT: Cell<Option<(Thread, usize)>> = const { Cell::new(None) };
}

fn current_entry() -> (Thread, usize) {
    if let Some(entry) = CURRENT.with(|c| c.get()) {
        return entry;
    }
    attach_foreign()
}

/// Register a thread the runtime did not create, marked initial so it is
/// never reclaimed.
fn attach_foreign() -> (Thread, usize) {
    sys::install_interrupt_handler();
    let (thread, ptr) = registry().allocate(ThreadAttr::new(), true);
    let tcb = unsafe { &*ptr };
    let tid = sys::gettid();
    tcb.host_handle
        .store(sys::self_thread_handle() as usize, SeqCst);
    tcb.tid.store(tid, SeqCst);
    registry().publish_tid(thread, tid);
    let entry = (thread, ptr as usize);
    CURRENT.with(|c| c.set(Some(entry)));
    log::debug!(target: "weft::thread", "attached foreign thread tid={tid}");
    entry
}

/// The calling thread's handle, registering it on first touch.
pub fn current() -> Thread {
    current_entry().0
}

/// Run `f` against the calling thread's TCB.
pub(crate) fn with_current<R>(f: impl FnOnce(&Tcb) -> R) -> R {
    let (_, addr) = current_entry();
    f(unsafe { &*(addr as *const Tcb) })
}

pub(crate) fn tid_of(tcb: &Tcb) -> u32 {
    tcb.tid.load(SeqCst)
}

/// Create a thread running `f`, whose return value becomes the exit
/// status observed by a joiner.
pub fn create<F>(attr: ThreadAttr, f: F) -> Result<Thread>
where
    F: FnOnce() -> usize + Send + 'static,
{
    // The creator itself must be registered first so the interrupt
    // handler is installed process-wide before anyone can be cancelled.
    let _ = current();

    let stack_size = attr.stack_size();
    let (thread, ptr) = registry().allocate(attr, false);
    let addr = ptr as usize;
    let spawned = std::thread::Builder::new()
        .stack_size(stack_size)
        .spawn(move || trampoline(thread, addr, f));
    match spawned {
        Ok(handle) => {
            // The host side of the thread is not observed again; lifetime
            // tracking happens through the tid word.
            drop(handle);
            Ok(thread)
        }
        Err(e) => {
            log::warn!(target: "weft::thread", "thread creation failed: {e}");
            let tcb = unsafe { &*ptr };
            tcb.set_flags(TcbFlags::DETACHED);
            tcb.set_state(STATE_DEAD);
            registry().on_thread_exit(thread);
            Err(Error::Again)
        }
    }
}

fn trampoline<F>(thread: Thread, tcb_addr: usize, f: F)
where
    F: FnOnce() -> usize + Send + 'static,
{
    let tcb = unsafe { &*(tcb_addr as *const Tcb) };
    sys::install_interrupt_handler();
    let tid = sys::refresh_tid();
    tcb.host_handle
        .store(sys::self_thread_handle() as usize, SeqCst);
    tcb.tid.store(tid, SeqCst);
    // A joiner may already be parked on the pending value.
    wait::wake_all(&tcb.tid);
    registry().publish_tid(thread, tid);
    CURRENT.with(|c| c.set(Some((thread, tcb_addr))));
    log::debug!(target: "weft::thread", "thread seq={} started tid={tid}", tcb.seq);

    let status = match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(status) => status,
        Err(payload) => {
            if payload.is::<Cancelled>() {
                CANCELED
            } else if let Some(exit) = payload.downcast_ref::<ExitRequest>() {
                exit.0
            } else {
                // An unhandled panic in the thread function cannot be
                // reported through an exit status.
                fatal("thread function panicked");
            }
        }
    };
    finish(tcb, thread, status);
}

/// Common termination bookkeeping: cleanup actions, TLS destructors,
/// status publication, then the registry-side tid clear that joiners
/// watch for. Nothing may touch the TCB from this thread afterwards.
fn finish(tcb: &Tcb, thread: Thread, status: usize) {
    run_cleanup(tcb);
    tls::run_destructors(tcb);
    tcb.exit_status.store(status, SeqCst);
    tcb.set_state(STATE_DEAD);
    let seq = tcb.seq;
    let remaining = registry().on_thread_exit(thread);
    log::debug!(
        target: "weft::thread",
        "thread seq={seq} finished status={status} remaining={remaining}"
    );
}

fn run_cleanup(tcb: &Tcb) {
    loop {
        let action = tcb.cleanup.lock().pop();
        match action {
            Some(action) => action(),
            None => break,
        }
    }
}

/// Terminate the calling thread with `status`.
///
/// From a runtime-created thread this unwinds to the trampoline. The
/// initial (or any foreign) thread cannot return through a trampoline: it
/// performs the same bookkeeping in place, then either ends the process
/// (if it was the last live thread) or parks its kernel thread forever.
pub fn exit(status: usize) -> ! {
    let (thread, addr) = current_entry();
    let tcb = unsafe { &*(addr as *const Tcb) };
    if !tcb.initial {
        cancel::exit_with(status);
    }

    run_cleanup(tcb);
    tls::run_destructors(tcb);
    tcb.exit_status.store(status, SeqCst);
    tcb.set_state(STATE_DEAD);
    let remaining = registry().on_thread_exit(thread);
    if remaining == 0 {
        std::process::exit(status as i32);
    }
    // Other threads live on; this kernel thread has nowhere to return to.
    loop {
        let cycle = tcb.suspend_cycle.load(SeqCst);
        wait::wait(&tcb.suspend_cycle, cycle, None);
    }
}

/// Claim on a target's joiner slot, released if the join unwinds or
/// times out before completion.
struct JoinClaim<'a> {
    target: &'a Tcb,
    armed: bool,
}

impl Drop for JoinClaim<'_> {
    fn drop(&mut self) {
        if self.armed {
            *self.target.joiner.lock() = JoinSlot::Vacant;
        }
    }
}

/// Wait for `thread` to terminate and collect its exit status. A
/// cancellation point. At most one thread may join a given target.
pub fn join(thread: Thread) -> Result<usize> {
    join_inner(thread, None)
}

/// [`join`] with an absolute deadline.
pub fn timedjoin(thread: Thread, deadline: Deadline) -> Result<usize> {
    join_inner(thread, Some(deadline))
}

fn join_inner(thread: Thread, deadline: Option<Deadline>) -> Result<usize> {
    let me = current();
    if thread == me {
        return Err(Error::Deadlock);
    }

    let target_ref = registry().ref_acquire(thread)?;
    let target = target_ref.tcb();
    if target.flags().contains(TcbFlags::DETACHED) {
        return Err(Error::Invalid);
    }
    {
        let mut slot = target.joiner.lock();
        match *slot {
            JoinSlot::Vacant | JoinSlot::Aborted => *slot = JoinSlot::Waiting(me),
            JoinSlot::Waiting(_) => return Err(Error::Invalid),
        }
    }
    let mut claim = JoinClaim {
        target,
        armed: true,
    };

    let status = with_current(|tcb| loop {
        // A concurrent detach abandons the join; the slot tells us so.
        if matches!(*target.joiner.lock(), JoinSlot::Aborted) {
            return Err(Error::Invalid);
        }
        let t = target.tid.load(SeqCst);
        if t == 0 {
            return Ok(target.exit_status.load(SeqCst));
        }
        let outcome = {
            let _point = PointGuard::enter(tcb);
            let _rec = cancel::ParkRecord::enter(tcb, WaitData::Thread(thread));
            wait::wait(&target.tid, t, deadline)
        };
        match outcome {
            WaitOutcome::TimedOut => return Err(Error::TimedOut),
            WaitOutcome::Interrupted => cancel::checkpoint_with(tcb),
            WaitOutcome::Woken | WaitOutcome::ValueChanged => {}
        }
    })?;
    claim.armed = false;
    *target.joiner.lock() = JoinSlot::Vacant;

    // A joined thread is reclaimable; fold it into the detached path.
    target.set_flags(TcbFlags::DETACHED);
    drop(claim);
    drop(target_ref);
    registry().retire(thread);
    Ok(status)
}

/// Mark `thread` detached so its control block is reclaimed on
/// termination without a join. A joiner already parked on the thread is
/// woken and its join fails.
pub fn detach(thread: Thread) -> Result<()> {
    registry().with(thread, |tcb| {
        if tcb.flags().contains(TcbFlags::DETACHED) {
            return Err(Error::Invalid);
        }
        let mut slot = tcb.joiner.lock();
        let parked = matches!(*slot, JoinSlot::Waiting(_));
        if parked {
            // Abandon the pending join; the joiner observes the slot and
            // fails with Invalid once woken.
            *slot = JoinSlot::Aborted;
        }
        drop(slot);
        tcb.set_flags(TcbFlags::DETACHED);
        if parked {
            wait::wake_all(&tcb.tid);
        }
        Ok(())
    })??;
    // If it already terminated, it can be queued for reclamation now.
    let dead = registry().with(thread, |tcb| tcb.is_dead()).unwrap_or(false);
    if dead {
        registry().retire(thread);
    }
    Ok(())
}

/// Look up a live thread by kernel tid.
pub fn find(tid: u32) -> Option<Thread> {
    registry().find(tid)
}

/// The number of live threads, the calling one included.
pub fn live_count() -> u32 {
    let _ = current();
    registry().live_count()
}

/// Trigger a reclamation pass over finished detached threads.
pub fn collect() {
    registry().gc();
}

/// Push a cleanup action run at thread exit (or cancellation), most
/// recent first.
pub fn cleanup_push(action: impl FnOnce() + Send + 'static) {
    with_current(|tcb| tcb.cleanup.lock().push(Box::new(action)));
}

/// Pop the most recently pushed cleanup action, running it if `execute`.
pub fn cleanup_pop(execute: bool) {
    let action = with_current(|tcb| tcb.cleanup.lock().pop());
    if let Some(action) = action {
        if execute {
            action();
        }
    }
}
