//! Process-wide tunables.
//!
//! These are read once, from the environment, the first time any of them is
//! needed, and never re-read. They tune the adaptive-mutex spin loops, the
//! minimum timeout granularity handed to the kernel, and the queue-discipline
//! hint for contended waiters.

use core::time::Duration;
use std::sync::OnceLock;

/// Default number of spin iterations before an adaptive mutex tries the
/// kernel.
const DEFAULT_SPIN_LOOPS: u32 = 2000;

/// Default number of yield-then-retry iterations after spinning.
const DEFAULT_YIELD_LOOPS: u32 = 0;

/// Tunables read from the environment at process start.
#[derive(Debug, Clone)]
pub struct Tunables {
    /// Default spin iteration count for adaptive mutexes
    /// (`WEFT_MUTEX_SPINLOOPS`).
    pub mutex_spin_loops: u32,

    /// Default yield iteration count for adaptive mutexes
    /// (`WEFT_MUTEX_YIELDLOOPS`).
    pub mutex_yield_loops: u32,

    /// Minimum timeout granularity passed to the kernel; shorter relative
    /// timeouts are rounded up to this (`WEFT_TIMEOUT_MIN_NS`).
    pub min_timeout: Duration,

    /// FIFO-vs-priority queue discipline hint for contended waiters
    /// (`WEFT_QUEUE_FIFO`). The kernel arbitrates wakeup order either way;
    /// this is recorded as a hint only.
    pub queue_fifo: bool,
}

fn parse_u32(name: &str, default: u32) -> u32 {
    match std::env::var(name) {
        Ok(s) => s.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

/// Return the process tunables, reading the environment on first use.
pub fn tunables() -> &'static Tunables {
    static TUNABLES: OnceLock<Tunables> = OnceLock::new();
    TUNABLES.get_or_init(|| {
        let t = Tunables {
            mutex_spin_loops: parse_u32("WEFT_MUTEX_SPINLOOPS", DEFAULT_SPIN_LOOPS),
            mutex_yield_loops: parse_u32("WEFT_MUTEX_YIELDLOOPS", DEFAULT_YIELD_LOOPS),
            min_timeout: Duration::from_nanos(parse_u32("WEFT_TIMEOUT_MIN_NS", 0) as u64),
            queue_fifo: parse_u32("WEFT_QUEUE_FIFO", 0) != 0,
        };
        log::debug!(
            target: "weft::config",
            "tunables: spin={} yield={} min_timeout={:?} fifo={}",
            t.mutex_spin_loops,
            t.mutex_yield_loops,
            t.min_timeout,
            t.queue_fifo
        );
        t
    })
}

#[cfg(test)]
mod tests {
    use super::tunables;

    #[test]
    fn defaults_resolve() {
        let t = tunables();
        assert!(t.mutex_spin_loops > 0);
        // Read twice; must be the same cached instance.
        assert_eq!(t.mutex_spin_loops, tunables().mutex_spin_loops);
    }
}
