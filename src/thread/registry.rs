//! The global thread registry and garbage collector.
//!
//! An insertion-ordered list of live TCBs, a hash index keyed by kernel tid,
//! a bounded free-list cache of retired control blocks, and the
//! pending-reclamation list the collector scans. The registry exclusively
//! owns every linked TCB; lookup-and-operate callers take a reference count
//! that keeps the block alive while they use it.
//!
//! The registry lock is internal: never user-visible, never a cancellation
//! point, and always bracketed by a critical section so a cancellation
//! handshake can't re-enter it. Re-entry from the holding thread is an
//! unrecoverable invariant violation.

use crate::error::{fatal, Error, Result};
use crate::sync::wait;
use crate::sync::{raw_lock, RawLock, RawLockGuard};
use crate::sys;
use crate::thread::cancel;
use crate::thread::tcb::{Tcb, TcbFlags, Thread, ThreadAttr};
use core::ops::{Deref, DerefMut};
use core::sync::atomic::Ordering::SeqCst;
use core::sync::atomic::AtomicU32;
use std::collections::HashMap;
use std::sync::OnceLock;

/// High-water mark for the retired-TCB cache; reclaimed blocks beyond this
/// are freed instead of cached.
const CACHE_HIGH_WATER: usize = 32;

struct Slot {
    generation: u32,
    tcb: Option<Box<Tcb>>,
}

pub(crate) struct Inner {
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
    /// Insertion-ordered list of live threads.
    order: Vec<Thread>,
    /// Hash index by kernel tid for O(1) lookup.
    by_tid: HashMap<u32, Thread>,
    /// Free-list cache of retired control blocks.
    cache: Vec<Box<Tcb>>,
    /// Finished-and-detached TCBs awaiting reclamation.
    gc_list: Vec<Thread>,
    live: u32,
    next_seq: u64,
}

pub(crate) struct Registry {
    inner: RawLock<Inner>,
    /// Tid of the thread currently holding the registry lock, for
    /// self-entry detection.
    holder: AtomicU32,
}

/// Registry lock guard: critical section + holder tracking around the
/// inner word lock.
pub(crate) struct RegGuard<'a> {
    registry: &'a Registry,
    guard: Option<RawLockGuard<'a, Inner>>,
    _critical: cancel::Section,
}

impl Deref for RegGuard<'_> {
    type Target = Inner;

    fn deref(&self) -> &Inner {
        self.guard.as_ref().unwrap()
    }
}

impl DerefMut for RegGuard<'_> {
    fn deref_mut(&mut self) -> &mut Inner {
        self.guard.as_mut().unwrap()
    }
}

impl Drop for RegGuard<'_> {
    fn drop(&mut self) {
        // Clear the holder before the lock is released so a new holder
        // never observes a stale tid.
        self.registry.holder.store(0, SeqCst);
        self.guard.take();
    }
}

/// A counted reference to one TCB, released on drop.
pub(crate) struct TcbRef<'a> {
    registry: &'a Registry,
    thread: Thread,
    ptr: *const Tcb,
}

impl TcbRef<'_> {
    pub(crate) fn tcb(&self) -> &Tcb {
        // The reference count taken in `ref_acquire` keeps the block
        // linked until this handle drops.
        unsafe { &*self.ptr }
    }
}

impl Drop for TcbRef<'_> {
    fn drop(&mut self) {
        self.registry.ref_release(self.thread);
    }
}

pub(crate) fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Registry {
        inner: raw_lock(Inner {
            slots: Vec::new(),
            free_slots: Vec::new(),
            order: Vec::new(),
            by_tid: HashMap::new(),
            cache: Vec::new(),
            gc_list: Vec::new(),
            live: 0,
            next_seq: 1,
        }),
        holder: AtomicU32::new(0),
    })
}

impl Registry {
    fn lock(&self) -> RegGuard<'_> {
        let critical = cancel::Section::enter();
        let me = sys::gettid();
        if self.holder.load(SeqCst) == me {
            fatal("registry lock already held by the calling thread");
        }
        let guard = self.inner.lock();
        self.holder.store(me, SeqCst);
        RegGuard {
            registry: self,
            guard: Some(guard),
            _critical: critical,
        }
    }

    /// Allocate (or reuse from the cache) a TCB and link it into the
    /// registry. The returned pointer stays valid until the block is
    /// reclaimed, which cannot happen before the thread is dead, detached,
    /// and unreferenced.
    pub(crate) fn allocate(&self, attr: ThreadAttr, initial: bool) -> (Thread, *const Tcb) {
        let mut inner = self.lock();
        Self::gc_locked(&mut inner);

        let seq = inner.next_seq;
        inner.next_seq += 1;

        let tcb = match inner.cache.pop() {
            Some(mut cached) => {
                cached.reinit(seq, attr, initial);
                cached
            }
            None => Box::new(Tcb::fresh(seq, attr, initial)),
        };
        let ptr: *const Tcb = &*tcb;

        let slot_index = match inner.free_slots.pop() {
            Some(i) => i,
            None => {
                inner.slots.push(Slot {
                    generation: 1,
                    tcb: None,
                });
                (inner.slots.len() - 1) as u32
            }
        };
        let generation = inner.slots[slot_index as usize].generation;
        inner.slots[slot_index as usize].tcb = Some(tcb);

        let thread = Thread {
            slot: slot_index,
            generation,
        };
        unsafe { (*ptr).set_flags(TcbFlags::IN_REGISTRY) };
        inner.order.push(thread);
        inner.live += 1;

        log::trace!(
            target: "weft::registry",
            "linked thread seq={} slot={} gen={} live={}",
            seq,
            slot_index,
            generation,
            inner.live
        );
        (thread, ptr)
    }

    fn tcb_ptr_locked(inner: &Inner, thread: Thread) -> Result<*const Tcb> {
        let slot = inner
            .slots
            .get(thread.slot as usize)
            .ok_or(Error::Invalid)?;
        if slot.generation != thread.generation {
            return Err(Error::Invalid);
        }
        let tcb = slot.tcb.as_deref().ok_or(Error::Invalid)?;
        if !tcb.valid() {
            return Err(Error::Invalid);
        }
        Ok(tcb as *const Tcb)
    }

    /// Take a counted reference for a lookup-and-operate sequence.
    pub(crate) fn ref_acquire(&self, thread: Thread) -> Result<TcbRef<'_>> {
        let inner = self.lock();
        let ptr = Self::tcb_ptr_locked(&inner, thread)?;
        unsafe { (*ptr).refs.fetch_add(1, SeqCst) };
        drop(inner);
        Ok(TcbRef {
            registry: self,
            thread,
            ptr,
        })
    }

    /// Run `f` against a live TCB while holding a reference to it.
    pub(crate) fn with<R>(&self, thread: Thread, f: impl FnOnce(&Tcb) -> R) -> Result<R> {
        let r = self.ref_acquire(thread)?;
        Ok(f(r.tcb()))
    }

    fn ref_release(&self, thread: Thread) {
        let mut inner = self.lock();
        let ptr = match Self::tcb_ptr_locked(&inner, thread) {
            Ok(p) => p,
            // Slot already recycled; the count went with it.
            Err(_) => return,
        };
        let tcb = unsafe { &*ptr };
        let prev = tcb.refs.fetch_sub(1, SeqCst);
        if prev == 0 {
            fatal("TCB reference count underflow");
        }
        if prev == 1 && tcb.is_dead() && tcb.flags().contains(TcbFlags::DETACHED) {
            Self::retire_locked(&mut inner, thread);
        }
    }

    /// Record the kernel-assigned tid in the hash index.
    pub(crate) fn publish_tid(&self, thread: Thread, tid: u32) {
        let mut inner = self.lock();
        if Self::tcb_ptr_locked(&inner, thread).is_ok() {
            inner.by_tid.insert(tid, thread);
        }
    }

    /// O(1) lookup by kernel tid.
    pub(crate) fn find(&self, tid: u32) -> Option<Thread> {
        let inner = self.lock();
        inner.by_tid.get(&tid).copied()
    }

    /// Unlink a finished thread from the live structures and queue it for
    /// reclamation. Idempotent; the initial thread is never retired.
    pub(crate) fn retire(&self, thread: Thread) {
        let mut inner = self.lock();
        if Self::tcb_ptr_locked(&inner, thread).is_ok() {
            Self::retire_locked(&mut inner, thread);
        }
    }

    fn retire_locked(inner: &mut Inner, thread: Thread) {
        let ptr = match Self::tcb_ptr_locked(inner, thread) {
            Ok(p) => p,
            Err(_) => return,
        };
        let tcb = unsafe { &*ptr };
        if tcb.initial || !tcb.flags().contains(TcbFlags::IN_REGISTRY) {
            return;
        }
        tcb.clear_flags(TcbFlags::IN_REGISTRY);
        inner.order.retain(|t| *t != thread);
        let tid = tcb.tid.load(SeqCst);
        if tid != 0 {
            inner.by_tid.remove(&tid);
        } else {
            inner.by_tid.retain(|_, t| *t != thread);
        }
        inner.gc_list.push(thread);
        log::trace!(
            target: "weft::registry",
            "retired thread seq={} to gc list",
            tcb.seq
        );
    }

    /// Bookkeeping for a thread that has finished running: drop it from
    /// the live count, clear the tid word and wake joiners, and queue a
    /// detached block for reclamation. The clear-and-wake happens under
    /// the registry lock so the block cannot be reclaimed between the two.
    /// Returns the number of live threads remaining.
    pub(crate) fn on_thread_exit(&self, thread: Thread) -> u32 {
        let mut inner = self.lock();
        if inner.live == 0 {
            fatal("live thread count underflow");
        }
        inner.live -= 1;
        let remaining = inner.live;
        if let Ok(ptr) = Self::tcb_ptr_locked(&inner, thread) {
            let tcb = unsafe { &*ptr };
            tcb.tid.store(0, SeqCst);
            wait::wake_all(&tcb.tid);
            if tcb.flags().contains(TcbFlags::DETACHED) {
                Self::retire_locked(&mut inner, thread);
            }
        }
        remaining
    }

    /// Scan the pending-reclamation list, reclaiming every control block
    /// whose thread the kernel reports terminated, with no references and
    /// marked detached. Invoked opportunistically before allocating.
    pub(crate) fn gc(&self) {
        let mut inner = self.lock();
        Self::gc_locked(&mut inner);
    }

    fn gc_locked(inner: &mut Inner) {
        let mut remaining = Vec::new();
        let pending = core::mem::take(&mut inner.gc_list);
        for thread in pending {
            let reclaim = match Self::tcb_ptr_locked(inner, thread) {
                Ok(ptr) => {
                    let tcb = unsafe { &*ptr };
                    !tcb.initial
                        && tcb.is_dead()
                        && tcb.flags().contains(TcbFlags::DETACHED)
                        && tcb.refs.load(SeqCst) == 0
                        && tcb.tid.load(SeqCst) == 0
                }
                Err(_) => false,
            };
            if !reclaim {
                if Self::tcb_ptr_locked(inner, thread).is_ok() {
                    remaining.push(thread);
                }
                continue;
            }

            let slot = &mut inner.slots[thread.slot as usize];
            let tcb = slot.tcb.take().unwrap();
            tcb.invalidate();
            slot.generation = slot.generation.wrapping_add(1).max(1);
            inner.free_slots.push(thread.slot);
            if inner.cache.len() < CACHE_HIGH_WATER {
                inner.cache.push(tcb);
            }
            log::trace!(target: "weft::registry", "reclaimed thread slot={}", thread.slot);
        }
        inner.gc_list = remaining;
    }

    /// Number of live threads.
    pub(crate) fn live_count(&self) -> u32 {
        self.lock().live
    }

    /// Post-fork reset in the child: only the calling thread survives.
    /// Force-releases the registry lock (the holder may not exist anymore)
    /// and rebuilds the tables around `survivor`.
    pub(crate) fn reset_for_child(&self, survivor: Thread, survivor_tid: u32) {
        unsafe { self.inner.force_unlock() };
        self.holder.store(0, SeqCst);
        let mut inner = self.lock();
        let keep = Self::tcb_ptr_locked(&inner, survivor).is_ok();
        let slot_count = inner.slots.len();
        for i in 0..slot_count {
            if keep && i as u32 == survivor.slot {
                continue;
            }
            if let Some(tcb) = inner.slots[i].tcb.take() {
                tcb.invalidate();
                drop(tcb);
                inner.slots[i].generation = inner.slots[i].generation.wrapping_add(1).max(1);
                inner.free_slots.push(i as u32);
            }
        }
        inner.order.clear();
        inner.by_tid.clear();
        inner.gc_list.clear();
        inner.cache.clear();
        inner.live = 0;
        if keep {
            inner.order.push(survivor);
            inner.by_tid.insert(survivor_tid, survivor);
            inner.live = 1;
        }
    }
}
