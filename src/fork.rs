//! Fork awareness.
//!
//! The runtime does not wrap the process's fork call; the embedder invokes
//! [`prepare`] before forking and [`parent_after`] / [`child_after`] on
//! the respective sides. `child_after` performs the minimal reset a child
//! needs: only the calling thread survives, so internal locks are forced
//! open, the registry is rebuilt around the survivor, and loader locks
//! are reissued unheld.

use crate::sync::{raw_lock, RawLock};
use crate::sys;
use crate::thread::registry::registry;
use core::sync::atomic::Ordering::SeqCst;
use std::sync::OnceLock;

type Handler = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Handlers {
    prepare: Vec<Handler>,
    parent: Vec<Handler>,
    child: Vec<Handler>,
}

fn handlers() -> &'static RawLock<Handlers> {
    static HANDLERS: OnceLock<RawLock<Handlers>> = OnceLock::new();
    HANDLERS.get_or_init(|| raw_lock(Handlers::default()))
}

/// Register fork callbacks; any of the three may be omitted.
pub fn at_fork(
    prepare: Option<Handler>,
    parent: Option<Handler>,
    child: Option<Handler>,
) {
    let mut handlers = handlers().lock();
    if let Some(f) = prepare {
        handlers.prepare.push(f);
    }
    if let Some(f) = parent {
        handlers.parent.push(f);
    }
    if let Some(f) = child {
        handlers.child.push(f);
    }
}

/// Run prepare callbacks, most recently registered first.
pub fn prepare() {
    let handlers = handlers().lock();
    for f in handlers.prepare.iter().rev() {
        f();
    }
}

/// Run parent-side callbacks in registration order.
pub fn parent_after() {
    let handlers = handlers().lock();
    for f in handlers.parent.iter() {
        f();
    }
}

/// Child-side reset and callbacks. Must be the first runtime call made in
/// the child.
pub fn child_after() {
    let tid = sys::refresh_tid();
    let survivor = crate::thread::current();
    crate::thread::with_current(|tcb| {
        tcb.tid.store(tid, SeqCst);
        tcb.host_handle
            .store(sys::self_thread_handle() as usize, SeqCst);
    });
    registry().reset_for_child(survivor, tid);
    crate::loader::reset_after_fork();

    let h = handlers();
    // The fork may have happened while another thread held this lock.
    unsafe { h.force_unlock() };
    let handlers = h.lock();
    for f in handlers.child.iter() {
        f();
    }
    log::debug!(target: "weft::fork", "child reset complete tid={tid}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn prepare_runs_in_reverse_registration_order() {
        static STAGE: AtomicU32 = AtomicU32::new(0);
        at_fork(
            Some(Box::new(|| {
                STAGE
                    .compare_exchange(1, 2, Ordering::SeqCst, Ordering::SeqCst)
                    .unwrap();
            })),
            None,
            None,
        );
        at_fork(
            Some(Box::new(|| {
                STAGE
                    .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                    .unwrap();
            })),
            None,
            None,
        );
        prepare();
        assert_eq!(STAGE.load(Ordering::SeqCst), 2);
        parent_after();
    }
}
