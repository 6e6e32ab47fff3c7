//! The thread control block.
//!
//! One `Tcb` exists per live or retired-but-cached thread. It is owned by
//! the registry while linked in; everything else refers to it through a
//! [`Thread`] handle (stable slot index plus generation tag) and the
//! registry's reference count, so a stale handle can always be told apart
//! from a reused slot.

use crate::error::{Error, Result};
use crate::sync::RawLock;
use crate::sys;
use bitflags::bitflags;
use core::sync::atomic::Ordering::SeqCst;
use core::sync::atomic::{AtomicU32, AtomicUsize};

/// Validity tag distinguishing a live TCB from freed memory reused by the
/// allocator.
pub(crate) const TCB_MAGIC: u32 = 0x7cb0_c0de;

/// Value of the tid word before the kernel has assigned an id. Distinct
/// from the terminated sentinel `0`, so a joiner that races thread startup
/// parks instead of returning early.
pub(crate) const TID_PENDING: u32 = u32::MAX;

/// Thread lifecycle states.
pub(crate) const STATE_RUNNING: u32 = 1;
pub(crate) const STATE_DEAD: u32 = 2;

// Cancellation state bits.
pub(crate) const CANCEL_ENABLE: u32 = 0x1;
pub(crate) const CANCEL_ASYNC: u32 = 0x2;
pub(crate) const CANCEL_AT_POINT: u32 = 0x4;
pub(crate) const CANCEL_PENDING: u32 = 0x8;

bitflags! {
    /// TCB flag bitset, orthogonal to the lifecycle state.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub(crate) struct TcbFlags: u32 {
        const NEEDS_SUSPEND = 0x1;
        const SUSPENDED = 0x2;
        const DETACHED = 0x4;
        const IN_REGISTRY = 0x8;
    }
}

/// A handle to a thread managed by this runtime.
///
/// Handles are plain copyable values: a stable slot index into the registry
/// plus the slot's generation at the time the thread was created. Operations
/// on a handle whose slot has since been recycled fail with
/// [`Error::Invalid`] rather than touching the wrong thread.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Thread {
    pub(crate) slot: u32,
    pub(crate) generation: u32,
}

/// What a thread is currently suspended on, if anything. Matched
/// exhaustively when a cancel or resume needs to nudge the thread out of
/// the kernel; the payload is the futex word the thread is parked on.
#[derive(Copy, Clone, Debug)]
pub(crate) enum WaitData {
    None,
    Mutex(usize),
    Condvar(usize),
    RwLock(usize),
    Barrier(usize),
    Thread(Thread),
    Suspend,
}

/// Slot for the one outstanding joiner a thread may have.
#[derive(Copy, Clone, Debug)]
pub(crate) enum JoinSlot {
    Vacant,
    Waiting(Thread),
    /// The thread was detached while a joiner was parked; the joiner must
    /// wake with an error.
    Aborted,
}

/// One mutex held by a thread, threaded onto the owner's owned-lock list.
/// `prev_ceiling` is meaningful only on the priority list: it is the
/// effective ceiling to restore when this mutex is unlocked.
pub(crate) struct OwnedEntry {
    pub(crate) addr: usize,
    pub(crate) prev_ceiling: u32,
}

/// The two ordered owned-lock lists: plain mutexes and priority-protocol
/// mutexes.
#[derive(Default)]
pub(crate) struct OwnedLocks {
    pub(crate) plain: Vec<OwnedEntry>,
    pub(crate) prio: Vec<OwnedEntry>,
}

/// Per-thread held-lock record for one rwlock, supporting recursive read
/// acquisition and self-deadlock detection.
pub(crate) struct RwHold {
    pub(crate) lock: usize,
    pub(crate) read: u32,
    pub(crate) write: u32,
}

/// Creation attributes for a thread.
#[derive(Clone, Debug)]
pub struct ThreadAttr {
    stack_size: usize,
    guard_size: usize,
    detached: bool,
    inherit_sched: bool,
}

/// Default stack size for new threads.
const DEFAULT_STACK_SIZE: usize = 2 << 20;

/// Smallest stack the runtime will accept.
const MIN_STACK_SIZE: usize = 16 * 1024;

impl Default for ThreadAttr {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            guard_size: sys::page_size(),
            detached: false,
            inherit_sched: true,
        }
    }
}

impl ThreadAttr {
    /// Attributes with the default stack size, one guard page, joinable,
    /// inheriting the creator's scheduling.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the stack size for the new thread.
    pub fn set_stack_size(&mut self, size: usize) -> Result<()> {
        if size < MIN_STACK_SIZE {
            return Err(Error::Invalid);
        }
        self.stack_size = size;
        Ok(())
    }

    /// The configured stack size.
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Set the guard region size recorded for the thread.
    pub fn set_guard_size(&mut self, size: usize) -> Result<()> {
        self.guard_size = size;
        Ok(())
    }

    /// The configured guard size.
    pub fn guard_size(&self) -> usize {
        self.guard_size
    }

    /// Caller-supplied stacks are not supported by the hosted thread
    /// supply; the runtime always allocates the stack itself.
    pub fn set_stack_addr(&mut self, _addr: *mut core::ffi::c_void) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Create the thread already detached.
    pub fn set_detached(&mut self, detached: bool) -> Result<()> {
        self.detached = detached;
        Ok(())
    }

    /// Whether the thread starts detached.
    pub fn detached(&self) -> bool {
        self.detached
    }

    /// Whether the new thread inherits the creator's scheduling policy.
    pub fn set_inherit_sched(&mut self, inherit: bool) -> Result<()> {
        self.inherit_sched = inherit;
        Ok(())
    }

    /// The inherit-scheduling setting.
    pub fn inherit_sched(&self) -> bool {
        self.inherit_sched
    }
}

/// The thread control block.
pub(crate) struct Tcb {
    magic: AtomicU32,

    /// Monotonically increasing creation-sequence id, for debugging and
    /// ordering.
    pub(crate) seq: u64,

    /// Kernel-assigned thread id. `TID_PENDING` until the thread starts,
    /// the kernel tid while it runs, and `0` once it has terminated; this
    /// word doubles as the futex joiners park on.
    pub(crate) tid: AtomicU32,

    state: AtomicU32,
    flags: AtomicU32,

    /// Reference count taken by lookup-and-operate callers, manipulated
    /// only under the registry lock.
    pub(crate) refs: AtomicU32,

    cancel: AtomicU32,

    pub(crate) exit_status: AtomicUsize,

    /// Cycle counter for the cooperative suspend handshake.
    pub(crate) suspend_cycle: AtomicU32,

    /// Flag mask owned by the dynamic-loader lock provider.
    pub(crate) loader_flags: AtomicU32,

    /// Effective priority ceiling from held `Protect` mutexes.
    pub(crate) ceiling: AtomicU32,

    /// Host thread handle targeted by the interrupt signal.
    pub(crate) host_handle: AtomicUsize,

    pub(crate) joiner: RawLock<JoinSlot>,
    pub(crate) wait_data: RawLock<WaitData>,
    pub(crate) owned: RawLock<OwnedLocks>,
    pub(crate) rw_holds: RawLock<Vec<RwHold>>,
    pub(crate) cleanup: RawLock<Vec<Box<dyn FnOnce() + Send>>>,
    /// Per-key values, `(key generation, value)` indexed by key slot.
    pub(crate) tls_values: RawLock<Vec<(u32, usize)>>,

    pub(crate) attr: ThreadAttr,

    /// The initial (process) thread is never reclaimed.
    pub(crate) initial: bool,
}

impl Tcb {
    pub(crate) fn fresh(seq: u64, attr: ThreadAttr, initial: bool) -> Self {
        Self {
            magic: AtomicU32::new(TCB_MAGIC),
            seq,
            tid: AtomicU32::new(TID_PENDING),
            state: AtomicU32::new(STATE_RUNNING),
            flags: AtomicU32::new(if attr.detached {
                TcbFlags::DETACHED.bits()
            } else {
                0
            }),
            refs: AtomicU32::new(0),
            cancel: AtomicU32::new(CANCEL_ENABLE),
            exit_status: AtomicUsize::new(0),
            suspend_cycle: AtomicU32::new(0),
            loader_flags: AtomicU32::new(0),
            ceiling: AtomicU32::new(0),
            host_handle: AtomicUsize::new(0),
            joiner: crate::sync::raw_lock(JoinSlot::Vacant),
            wait_data: crate::sync::raw_lock(WaitData::None),
            owned: crate::sync::raw_lock(OwnedLocks { plain: Vec::new(), prio: Vec::new() }),
            rw_holds: crate::sync::raw_lock(Vec::new()),
            cleanup: crate::sync::raw_lock(Vec::new()),
            tls_values: crate::sync::raw_lock(Vec::new()),
            attr,
            initial,
        }
    }

    /// Re-initialize a cached TCB for reuse. The registry holds the box
    /// exclusively at this point.
    pub(crate) fn reinit(&mut self, seq: u64, attr: ThreadAttr, initial: bool) {
        self.seq = seq;
        self.tid.store(TID_PENDING, SeqCst);
        self.state.store(STATE_RUNNING, SeqCst);
        self.flags.store(
            if attr.detached {
                TcbFlags::DETACHED.bits()
            } else {
                0
            },
            SeqCst,
        );
        self.refs.store(0, SeqCst);
        self.cancel.store(CANCEL_ENABLE, SeqCst);
        self.exit_status.store(0, SeqCst);
        self.suspend_cycle.store(0, SeqCst);
        self.loader_flags.store(0, SeqCst);
        self.ceiling.store(0, SeqCst);
        self.host_handle.store(0, SeqCst);
        *self.joiner.lock() = JoinSlot::Vacant;
        *self.wait_data.lock() = WaitData::None;
        *self.owned.lock() = OwnedLocks::default();
        self.rw_holds.lock().clear();
        self.cleanup.lock().clear();
        self.tls_values.lock().clear();
        self.attr = attr;
        self.initial = initial;
        self.magic.store(TCB_MAGIC, SeqCst);
    }

    pub(crate) fn valid(&self) -> bool {
        self.magic.load(SeqCst) == TCB_MAGIC
    }

    pub(crate) fn invalidate(&self) {
        self.magic.store(!TCB_MAGIC, SeqCst);
    }

    pub(crate) fn state(&self) -> u32 {
        self.state.load(SeqCst)
    }

    pub(crate) fn set_state(&self, state: u32) {
        self.state.store(state, SeqCst);
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.state() == STATE_DEAD
    }

    pub(crate) fn flags(&self) -> TcbFlags {
        TcbFlags::from_bits_truncate(self.flags.load(SeqCst))
    }

    pub(crate) fn set_flags(&self, f: TcbFlags) {
        self.flags.fetch_or(f.bits(), SeqCst);
    }

    pub(crate) fn clear_flags(&self, f: TcbFlags) {
        self.flags.fetch_and(!f.bits(), SeqCst);
    }

    pub(crate) fn cancel_bits(&self) -> u32 {
        self.cancel.load(SeqCst)
    }

    /// Set cancel bits, returning the previous word.
    pub(crate) fn cancel_set(&self, bits: u32) -> u32 {
        self.cancel.fetch_or(bits, SeqCst)
    }

    /// Clear cancel bits, returning the previous word.
    pub(crate) fn cancel_clear(&self, bits: u32) -> u32 {
        self.cancel.fetch_and(!bits, SeqCst)
    }

    /// Whether a pending cancel is deliverable right now (enabled and not
    /// already consumed).
    pub(crate) fn cancel_deliverable(&self) -> bool {
        let bits = self.cancel_bits();
        bits & CANCEL_ENABLE != 0 && bits & CANCEL_PENDING != 0
    }
}
