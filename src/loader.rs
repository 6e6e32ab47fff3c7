//! Lock services for a dynamic loader.
//!
//! The loader brings its own locking discipline but not its own locks: it
//! asks the runtime for opaque lock handles and takes them in read or
//! write mode around its internal structures. Loader acquisitions are
//! never cancellation points and hold a critical section for their whole
//! span, so a loader callback can never be unwound while a loader lock is
//! held. The per-thread flag word the loader uses to mark special states
//! lives in the owning thread's TCB.

use crate::error::{Error, Result};
use crate::sync::{raw_lock, RawLock, RwLock};
use crate::thread::cancel;
use core::sync::atomic::Ordering::SeqCst;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// Opaque handle to a loader lock.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct LoaderLock(u64);

struct LockTable {
    locks: HashMap<u64, Arc<RwLock>>,
    next_id: u64,
}

fn table() -> &'static RawLock<LockTable> {
    static TABLE: OnceLock<RawLock<LockTable>> = OnceLock::new();
    TABLE.get_or_init(|| {
        raw_lock(LockTable {
            locks: HashMap::new(),
            next_id: 1,
        })
    })
}

fn lookup(lock: LoaderLock) -> Result<Arc<RwLock>> {
    let table = table().lock();
    table.locks.get(&lock.0).cloned().ok_or(Error::Invalid)
}

/// Create a loader lock.
pub fn create_lock() -> LoaderLock {
    let mut table = table().lock();
    let id = table.next_id;
    table.next_id += 1;
    table.locks.insert(id, Arc::new(RwLock::new()));
    LoaderLock(id)
}

/// Destroy a loader lock. Fails with [`Error::Busy`] while held.
pub fn destroy_lock(lock: LoaderLock) -> Result<()> {
    let mut table = table().lock();
    let rw = table.locks.get(&lock.0).cloned().ok_or(Error::Invalid)?;
    rw.destroy()?;
    table.locks.remove(&lock.0);
    Ok(())
}

/// Take a loader lock in shared mode and enter a critical section.
pub fn acquire_read(lock: LoaderLock) -> Result<()> {
    let rw = lookup(lock)?;
    cancel::critical_enter();
    if let Err(e) = rw.rdlock() {
        cancel::critical_leave();
        return Err(e);
    }
    Ok(())
}

/// Take a loader lock in exclusive mode and enter a critical section.
pub fn acquire_write(lock: LoaderLock) -> Result<()> {
    let rw = lookup(lock)?;
    cancel::critical_enter();
    if let Err(e) = rw.wrlock() {
        cancel::critical_leave();
        return Err(e);
    }
    Ok(())
}

/// Release a loader lock taken in either mode and leave the matching
/// critical section.
pub fn release(lock: LoaderLock) -> Result<()> {
    let rw = lookup(lock)?;
    rw.unlock()?;
    cancel::critical_leave();
    Ok(())
}

/// Set bits in the calling thread's loader flag word, returning the
/// previous word.
pub fn set_thread_flag(mask: u32) -> u32 {
    crate::thread::with_current(|tcb| tcb.loader_flags.fetch_or(mask, SeqCst))
}

/// Clear bits in the calling thread's loader flag word, returning the
/// previous word.
pub fn clear_thread_flag(mask: u32) -> u32 {
    crate::thread::with_current(|tcb| tcb.loader_flags.fetch_and(!mask, SeqCst))
}

/// Post-fork reset: the child starts with fresh, unheld loader locks
/// under the same handles.
pub(crate) fn reset_after_fork() {
    let t = table();
    unsafe { t.force_unlock() };
    let mut table = t.lock();
    for rw in table.locks.values_mut() {
        *rw = Arc::new(RwLock::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_acquisitions_share() {
        let lock = create_lock();
        acquire_read(lock).unwrap();
        acquire_read(lock).unwrap();
        release(lock).unwrap();
        release(lock).unwrap();
        destroy_lock(lock).unwrap();
        assert_eq!(acquire_read(lock).unwrap_err(), Error::Invalid);
    }

    #[test]
    fn held_locks_refuse_destruction() {
        let lock = create_lock();
        acquire_write(lock).unwrap();
        assert_eq!(destroy_lock(lock).unwrap_err(), Error::Busy);
        release(lock).unwrap();
        destroy_lock(lock).unwrap();
    }

    #[test]
    fn thread_flags_round_trip() {
        let prev = set_thread_flag(0b110);
        assert_eq!(set_thread_flag(0b001) & 0b110, 0b110);
        clear_thread_flag(0b111);
        assert_eq!(set_thread_flag(0) & 0b111, 0);
        let _ = prev;
    }
}
