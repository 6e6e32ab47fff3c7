//! Error codes returned by the runtime.
//!
//! Every fallible operation returns one of these as an ordinary result code;
//! nothing in the runtime reports errors asynchronously. The variants mirror
//! the POSIX errno values the operations are specified with, so they can be
//! handed straight back to C-flavored callers via [`Error::to_errno`].

use core::fmt;

/// The error taxonomy of the runtime.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Malformed attributes, null or stale handles, out-of-range timeout
    /// fields. Corresponds to `EINVAL`.
    Invalid,

    /// Ownership violation: unlocking a lock the caller doesn't hold, or
    /// using a priority-ceiling accessor on a mutex without the `Protect`
    /// protocol. Corresponds to `EPERM`.
    Perm,

    /// The object still has an owner or waiters. Corresponds to `EBUSY`.
    Busy,

    /// The object has been destroyed. Distinguished from [`Error::Invalid`]
    /// so that use-after-destroy is never confused with an uninitialized
    /// static. Maps to `EINVAL` for errno consumers.
    Destroyed,

    /// The operation would deadlock on the calling thread itself: relocking
    /// a non-recursive mutex, relocking an rwlock in a conflicting mode, or
    /// joining self. Corresponds to `EDEADLK`.
    Deadlock,

    /// A resource table is exhausted and the operation may succeed later.
    /// Corresponds to `EAGAIN`.
    Again,

    /// Allocation failure for a control block, stack, or TLS block.
    /// Corresponds to `ENOMEM`.
    NoMem,

    /// The operation is not supported by this runtime, for example
    /// registering a second joiner on one thread. Corresponds to `ENOTSUP`.
    NotSupported,

    /// A timed operation reached its deadline. Corresponds to `ETIMEDOUT`.
    TimedOut,
}

impl Error {
    /// The errno value conventionally used for this error.
    pub fn to_errno(self) -> i32 {
        match self {
            Self::Invalid | Self::Destroyed => libc::EINVAL,
            Self::Perm => libc::EPERM,
            Self::Busy => libc::EBUSY,
            Self::Deadlock => libc::EDEADLK,
            Self::Again => libc::EAGAIN,
            Self::NoMem => libc::ENOMEM,
            Self::NotSupported => libc::ENOTSUP,
            Self::TimedOut => libc::ETIMEDOUT,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Invalid => "invalid argument or handle",
            Self::Perm => "operation not permitted for caller",
            Self::Busy => "object busy",
            Self::Destroyed => "object destroyed",
            Self::Deadlock => "operation would deadlock on self",
            Self::Again => "resource temporarily unavailable",
            Self::NoMem => "out of memory",
            Self::NotSupported => "operation not supported",
            Self::TimedOut => "timed out",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Report an internal invariant violation and terminate the process.
///
/// Continuing after one of these would corrupt shared structures for every
/// thread, so there is no recovery path.
pub(crate) fn fatal(msg: &str) -> ! {
    log::error!(target: "weft", "fatal: {}", msg);
    eprintln!("weft: fatal: {}", msg);
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn errno_mapping() {
        assert_eq!(Error::TimedOut.to_errno(), libc::ETIMEDOUT);
        assert_eq!(Error::Deadlock.to_errno(), libc::EDEADLK);
        // Destroyed is reported as EINVAL but stays a distinct variant.
        assert_eq!(Error::Destroyed.to_errno(), libc::EINVAL);
        assert_ne!(Error::Destroyed, Error::Invalid);
    }
}
