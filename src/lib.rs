//! A user-space threading runtime built on a futex-style kernel wait/wake
//! primitive.
//!
//! The crate provides the synchronization engines ([`Mutex`], [`Condvar`],
//! [`RwLock`], [`Barrier`]), thread lifecycle management (create, join,
//! detach, exit, cancel, suspend) backed by a generation-tagged registry
//! with deferred reclamation, thread-specific data keys, lock services for
//! a dynamic loader, and fork awareness.
//!
//! Blocking operations that take a [`Deadline`] treat it as an absolute
//! point on a [`Clock`], re-measured before every kernel block. Public
//! blocking calls documented as cancellation points cooperate with
//! [`thread::cancel`]: the victim unwinds its own stack, running its
//! cleanup actions and releasing what the engines re-acquire on its
//! behalf.

#![cfg(target_os = "linux")]

pub mod config;
pub mod error;
pub mod fork;
pub mod loader;
pub mod sync;
pub mod thread;

mod sys;

pub use error::{Error, Result};
pub use sync::wait::Clock;
pub use sync::{
    Barrier, BarrierWaitResult, Condvar, Deadline, Mutex, MutexAttr, MutexType, Protocol, RwLock,
};
pub use thread::{Thread, ThreadAttr, CANCELED};
