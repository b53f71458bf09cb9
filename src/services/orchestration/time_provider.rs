//! Time provider shared by every controller of a participant
//!
//! In synchronized mode the time-sync service caches the current simulation
//! step here before invoking the step handler, so controllers stamp outbound
//! events with virtual time. Without synchronization, wall-clock time since
//! the Unix epoch is used.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub struct TimeProvider {
    synchronized: AtomicBool,
    now_ns: AtomicI64,
    duration_ns: AtomicI64,
}

impl TimeProvider {
    pub fn new() -> Self {
        Self {
            synchronized: AtomicBool::new(false),
            now_ns: AtomicI64::new(0),
            duration_ns: AtomicI64::new(0),
        }
    }

    pub fn set_synchronized(&self, on: bool) {
        self.synchronized.store(on, Ordering::Relaxed);
    }

    pub fn is_synchronized(&self) -> bool {
        self.synchronized.load(Ordering::Relaxed)
    }

    /// Called by the time-sync service at the start of every step.
    pub fn set_time(&self, now_ns: i64, duration_ns: i64) {
        self.now_ns.store(now_ns, Ordering::Relaxed);
        self.duration_ns.store(duration_ns, Ordering::Relaxed);
    }

    pub fn now_ns(&self) -> i64 {
        if self.is_synchronized() {
            self.now_ns.load(Ordering::Relaxed)
        } else {
            wall_clock_ns()
        }
    }

    pub fn current_step_duration_ns(&self) -> i64 {
        self.duration_ns.load(Ordering::Relaxed)
    }
}

impl Default for TimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

pub fn wall_clock_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synchronized_provider_reports_cached_step_time() {
        let tp = TimeProvider::new();
        tp.set_synchronized(true);
        tp.set_time(5_000_000, 1_000_000);
        assert_eq!(tp.now_ns(), 5_000_000);
        assert_eq!(tp.current_step_duration_ns(), 1_000_000);
    }

    #[test]
    fn unsynchronized_provider_follows_wall_clock() {
        let tp = TimeProvider::new();
        assert!(tp.now_ns() > 1_500_000_000_000_000_000);
    }
}
