//! Wall-clock time with monotonic progression.
//!
//! Span start and duration timestamps are nanoseconds since the Unix epoch,
//! derived from a wall-clock anchor captured once plus a monotonic offset so
//! that durations are immune to clock steps. The clock is a trait object so
//! tests can substitute a manually driven source.

use std::fmt;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Source of nanosecond timestamps used for span start and finish times.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Returns the current time as nanoseconds since the Unix epoch.
    fn now(&self) -> i64;
}

#[derive(Debug)]
struct SystemClock {
    wall_anchor: i64,
    monotonic_anchor: Instant,
}

impl SystemClock {
    fn new() -> Self {
        let wall_anchor = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        SystemClock {
            wall_anchor,
            monotonic_anchor: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        self.wall_anchor + self.monotonic_anchor.elapsed().as_nanos() as i64
    }
}

/// Returns the default monotonic system clock.
pub(crate) fn system() -> Arc<dyn Clock> {
    Arc::new(SystemClock::new())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Clock;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::Duration;

    /// A clock driven by hand, for deterministic timing in tests.
    #[derive(Debug, Default)]
    pub(crate) struct ManualClock {
        ns: AtomicI64,
    }

    impl ManualClock {
        pub(crate) fn new(start_ns: i64) -> Self {
            ManualClock {
                ns: AtomicI64::new(start_ns),
            }
        }

        pub(crate) fn advance(&self, by: Duration) {
            self.ns.fetch_add(by.as_nanos() as i64, Ordering::SeqCst);
        }

        pub(crate) fn set(&self, ns: i64) {
            self.ns.store(ns, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> i64 {
            self.ns.load(Ordering::SeqCst)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
        assert!(a > 0);
    }
}
