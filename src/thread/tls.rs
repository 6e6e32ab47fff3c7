//! Thread-specific data keys.
//!
//! A global key table hands out `(slot, generation)` keys; per-thread
//! values live in the owning thread's TCB, tagged with the key generation
//! so a value stored under a deleted-and-reused slot is never observed by
//! the new key. Destructors run at thread exit, repeated for values
//! re-stored by other destructors, up to a fixed round limit.

use crate::error::{Error, Result};
use crate::sync::{raw_lock, RawLock};
use crate::thread::tcb::Tcb;
use std::sync::OnceLock;

/// Rounds of destructor iteration at thread exit.
const DESTRUCTOR_ROUNDS: usize = 4;

/// A destructor invoked with the thread's non-zero value for the key.
pub type KeyDestructor = fn(usize);

/// A thread-specific data key.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Key {
    slot: u32,
    generation: u32,
}

struct KeyEntry {
    generation: u32,
    live: bool,
    destructor: Option<KeyDestructor>,
}

struct KeyTable {
    entries: Vec<KeyEntry>,
    free: Vec<u32>,
}

fn table() -> &'static RawLock<KeyTable> {
    static TABLE: OnceLock<RawLock<KeyTable>> = OnceLock::new();
    TABLE.get_or_init(|| {
        raw_lock(KeyTable {
            entries: Vec::new(),
            free: Vec::new(),
        })
    })
}

/// Allocate a key, optionally with a destructor run at thread exit for
/// threads holding a non-zero value.
pub fn create_key(destructor: Option<KeyDestructor>) -> Key {
    let mut table = table().lock();
    match table.free.pop() {
        Some(slot) => {
            let entry = &mut table.entries[slot as usize];
            entry.live = true;
            entry.destructor = destructor;
            Key {
                slot,
                generation: entry.generation,
            }
        }
        None => {
            table.entries.push(KeyEntry {
                generation: 1,
                live: true,
                destructor,
            });
            Key {
                slot: (table.entries.len() - 1) as u32,
                generation: 1,
            }
        }
    }
}

/// Delete a key. Values stored under it are abandoned without running the
/// destructor; the slot is reusable with a new generation.
pub fn delete_key(key: Key) -> Result<()> {
    let mut table = table().lock();
    let entry = table
        .entries
        .get_mut(key.slot as usize)
        .ok_or(Error::Invalid)?;
    if !entry.live || entry.generation != key.generation {
        return Err(Error::Invalid);
    }
    entry.live = false;
    entry.destructor = None;
    entry.generation = entry.generation.wrapping_add(1).max(1);
    table.free.push(key.slot);
    Ok(())
}

fn validate(key: Key) -> Result<()> {
    let table = table().lock();
    let entry = table.entries.get(key.slot as usize).ok_or(Error::Invalid)?;
    if !entry.live || entry.generation != key.generation {
        return Err(Error::Invalid);
    }
    Ok(())
}

/// Store the calling thread's value for `key`.
pub fn set(key: Key, value: usize) -> Result<()> {
    validate(key)?;
    crate::thread::with_current(|tcb| {
        let mut values = tcb.tls_values.lock();
        let index = key.slot as usize;
        if values.len() <= index {
            values.resize(index + 1, (0, 0));
        }
        values[index] = (key.generation, value);
    });
    Ok(())
}

/// The calling thread's value for `key`, zero if never stored.
pub fn get(key: Key) -> Result<usize> {
    validate(key)?;
    Ok(crate::thread::with_current(|tcb| {
        let values = tcb.tls_values.lock();
        match values.get(key.slot as usize) {
            Some(&(generation, value)) if generation == key.generation => value,
            _ => 0,
        }
    }))
}

/// Run key destructors for an exiting thread. A destructor may store new
/// values, so iterate until quiescent, bounded by `DESTRUCTOR_ROUNDS`.
pub(crate) fn run_destructors(tcb: &Tcb) {
    for _ in 0..DESTRUCTOR_ROUNDS {
        let mut ran_any = false;
        let slot_count = table().lock().entries.len();
        for slot in 0..slot_count {
            // Snapshot the destructor and value without holding either
            // lock across the call; the destructor is arbitrary code.
            let destructor = {
                let table = table().lock();
                let entry = &table.entries[slot];
                if !entry.live {
                    continue;
                }
                match entry.destructor {
                    Some(d) => (d, entry.generation),
                    None => continue,
                }
            };
            let (destructor, generation) = destructor;
            let value = {
                let mut values = tcb.tls_values.lock();
                match values.get_mut(slot) {
                    Some(entry) if entry.0 == generation && entry.1 != 0 => {
                        let value = entry.1;
                        *entry = (0, 0);
                        Some(value)
                    }
                    _ => None,
                }
            };
            if let Some(value) = value {
                destructor(value);
                ran_any = true;
            }
        }
        if !ran_any {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_are_per_thread() {
        let key = create_key(None);
        set(key, 41).unwrap();
        std::thread::scope(|s| {
            s.spawn(move || {
                assert_eq!(get(key).unwrap(), 0);
                set(key, 17).unwrap();
                assert_eq!(get(key).unwrap(), 17);
            });
        });
        assert_eq!(get(key).unwrap(), 41);
        delete_key(key).unwrap();
    }

    #[test]
    fn deleted_keys_are_rejected_and_slots_reused() {
        let key = create_key(None);
        set(key, 9).unwrap();
        delete_key(key).unwrap();
        assert_eq!(get(key).unwrap_err(), Error::Invalid);
        assert_eq!(set(key, 1).unwrap_err(), Error::Invalid);

        // A reused slot never sees the stale value.
        let next = create_key(None);
        if next.slot == key.slot {
            assert_ne!(next.generation, key.generation);
            assert_eq!(get(next).unwrap(), 0);
        }
        delete_key(next).unwrap();
    }

    #[test]
    fn destructors_run_at_thread_exit() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static SEEN: AtomicUsize = AtomicUsize::new(0);
        fn dtor(value: usize) {
            SEEN.fetch_add(value, Ordering::SeqCst);
        }

        let key = create_key(Some(dtor));
        let t = crate::thread::create(crate::thread::ThreadAttr::new(), move || {
            set(key, 5).unwrap();
            0
        })
        .unwrap();
        crate::thread::join(t).unwrap();
        assert_eq!(SEEN.load(Ordering::SeqCst), 5);
        delete_key(key).unwrap();
    }
}
